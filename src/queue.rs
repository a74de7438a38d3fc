// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The transfer queue serializes uploads against a single device connection.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    audio::{AudioError, Normalizer, ProcessedAudio},
    midi::DeviceConnection,
    playsync::CancelHandle,
    sds::{Progress, TransferError, TransferSession},
};

/// The slots a user may write to, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub first: u16,
    pub last: u16,
}

impl SlotRange {
    pub fn contains(&self, slot: u16) -> bool {
        (self.first..=self.last).contains(&slot)
    }
}

impl Default for SlotRange {
    fn default() -> Self {
        SlotRange { first: 0, last: 99 }
    }
}

/// Identifies a transfer request for its whole life in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    fn next() -> TransferId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TransferId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the audio for a transfer comes from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Audio that has already been normalized.
    Ready(ProcessedAudio),
    /// A file that is normalized when its turn comes.
    File(PathBuf),
}

impl AudioSource {
    fn name(&self) -> String {
        match self {
            AudioSource::Ready(audio) => audio.source_name().to_string(),
            AudioSource::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// A request to write audio into a slot.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    id: TransferId,
    source: AudioSource,
    slot: u16,
}

impl TransferRequest {
    pub fn new(source: AudioSource, slot: u16) -> TransferRequest {
        TransferRequest {
            id: TransferId::next(),
            source,
            slot,
        }
    }

    pub fn ready(audio: ProcessedAudio, slot: u16) -> TransferRequest {
        TransferRequest::new(AudioSource::Ready(audio), slot)
    }

    pub fn file(path: impl Into<PathBuf>, slot: u16) -> TransferRequest {
        TransferRequest::new(AudioSource::File(path.into()), slot)
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// The file to upload, if the audio hasn't been normalized yet.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            AudioSource::File(path) => Some(path),
            AudioSource::Ready(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Processing,
    Transferring,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

struct QueueEntry {
    request: TransferRequest,
    status: TransferStatus,
    progress_percent: u8,
    error_reason: Option<String>,
}

impl QueueEntry {
    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.request.id,
            slot: self.request.slot,
            source_name: self.request.source.name(),
            status: self.status,
            progress_percent: self.progress_percent,
            error_reason: self.error_reason.clone(),
        }
    }
}

/// A point-in-time view of a queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: TransferId,
    pub slot: u16,
    pub source_name: String,
    pub status: TransferStatus,
    pub progress_percent: u8,
    pub error_reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("slot {slot} is outside the writable range {first}-{last}")]
    InvalidSlot { slot: u16, first: u16, last: u16 },

    #[error("slot {0} already has a transfer in progress")]
    SlotBusy(u16),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Called whenever an entry changes status or progress.
pub type Listener = dyn Fn(&EntrySnapshot) + Send + Sync;

#[derive(Default)]
struct QueueState {
    entries: Vec<QueueEntry>,
    running: bool,
}

/// Runs transfer requests one at a time, in the order they were enqueued.
#[derive(Clone)]
pub struct TransferQueue {
    state: Arc<Mutex<QueueState>>,
    slots: SlotRange,
    normalizer: Normalizer,
    cancel_handle: Arc<Mutex<CancelHandle>>,
    listener: Arc<Mutex<Option<Arc<Listener>>>>,
}

impl TransferQueue {
    pub fn new(slots: SlotRange, normalizer: Normalizer) -> TransferQueue {
        TransferQueue {
            state: Arc::new(Mutex::new(QueueState::default())),
            slots,
            normalizer,
            cancel_handle: Arc::new(Mutex::new(CancelHandle::new())),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets the listener notified of every entry change.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    /// Adds a request to the queue. Rejects slots outside the writable range and
    /// slots that already have a transfer underway, leaving the queue untouched.
    pub fn enqueue(&self, request: TransferRequest) -> Result<TransferId, QueueError> {
        let slot = request.slot;
        if !self.slots.contains(slot) {
            return Err(QueueError::InvalidSlot {
                slot,
                first: self.slots.first,
                last: self.slots.last,
            });
        }

        let snapshot = {
            let mut state = self.state.lock();
            if state
                .entries
                .iter()
                .any(|entry| entry.request.slot == slot && !entry.status.is_terminal())
            {
                return Err(QueueError::SlotBusy(slot));
            }

            let entry = QueueEntry {
                request,
                status: TransferStatus::Pending,
                progress_percent: 0,
                error_reason: None,
            };
            let snapshot = entry.snapshot();
            state.entries.push(entry);
            snapshot
        };

        info!(id = %snapshot.id, slot, source = snapshot.source_name, "Queued transfer.");
        self.notify(&snapshot);
        Ok(snapshot.id)
    }

    /// Processes pending entries one at a time until none are left or the queue
    /// is cancelled. A failed entry doesn't stop the ones after it. If the queue
    /// is already running, this returns immediately and the running loop picks up
    /// any new entries.
    pub async fn run(&self, connection: &mut DeviceConnection) -> Result<(), QueueError> {
        if !connection.is_bound() {
            return Err(TransferError::TransportUnavailable.into());
        }

        {
            let mut state = self.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }
        let cancel_handle = CancelHandle::new();
        *self.cancel_handle.lock() = cancel_handle.clone();

        let span = info_span!("transfer queue", device = connection.device_name());
        async {
            while !cancel_handle.is_cancelled() {
                let Some(request) = self.next_pending() else {
                    break;
                };
                self.process(connection, &request, &cancel_handle).await;
            }
        }
        .instrument(span)
        .await;

        self.state.lock().running = false;
        Ok(())
    }

    /// Enqueues a single request and runs the queue.
    pub async fn quick_enqueue_and_run(
        &self,
        request: TransferRequest,
        connection: &mut DeviceConnection,
    ) -> Result<TransferId, QueueError> {
        let id = self.enqueue(request)?;
        self.run(connection).await?;
        Ok(id)
    }

    /// Fails every unfinished entry and stops the run loop. The active session
    /// stops at its next decision point.
    pub fn cancel(&self) {
        self.cancel_handle.lock().cancel();

        let cancelled = {
            let mut state = self.state.lock();
            state
                .entries
                .iter_mut()
                .filter(|entry| !entry.status.is_terminal())
                .map(|entry| {
                    entry.status = TransferStatus::Failed;
                    entry.error_reason = Some("cancelled".to_string());
                    entry.snapshot()
                })
                .collect::<Vec<EntrySnapshot>>()
        };

        if !cancelled.is_empty() {
            info!(cancelled = cancelled.len(), "Cancelled queued transfers.");
        }
        for snapshot in &cancelled {
            self.notify(snapshot);
        }
    }

    /// Removes completed and failed entries. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|entry| !entry.status.is_terminal());
        before - state.entries.len()
    }

    /// Returns a snapshot of every entry, in enqueue order.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.state
            .lock()
            .entries
            .iter()
            .map(QueueEntry::snapshot)
            .collect()
    }

    /// Returns a snapshot of the given entry.
    pub fn entry(&self, id: TransferId) -> Option<EntrySnapshot> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|entry| entry.request.id == id)
            .map(QueueEntry::snapshot)
    }

    fn next_pending(&self) -> Option<TransferRequest> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|entry| entry.status == TransferStatus::Pending)
            .map(|entry| entry.request.clone())
    }

    async fn process(
        &self,
        connection: &mut DeviceConnection,
        request: &TransferRequest,
        cancel_handle: &CancelHandle,
    ) {
        let audio = match &request.source {
            AudioSource::Ready(audio) => audio.clone(),
            AudioSource::File(path) => {
                self.set_status(request.id, TransferStatus::Processing);
                match self.normalizer.normalize_file(path) {
                    Ok(audio) => audio,
                    Err(e) => {
                        self.finish(request.id, Err(QueueError::from(e)));
                        return;
                    }
                }
            }
        };

        self.set_status(request.id, TransferStatus::Transferring);
        let result = TransferSession::new(connection, request.slot, &audio)
            .with_cancel_handle(cancel_handle.clone())
            .run(|progress: &Progress| self.set_progress(request.id, progress.percent()))
            .await;
        self.finish(request.id, result.map(|_| ()).map_err(QueueError::from));
    }

    fn set_status(&self, id: TransferId, status: TransferStatus) {
        let snapshot = self.update(id, |entry| {
            if entry.status.is_terminal() || entry.status == status {
                return false;
            }
            entry.status = status;
            true
        });
        if let Some(snapshot) = snapshot {
            info!(id = %id, slot = snapshot.slot, status = %status, "Transfer status changed.");
        }
    }

    fn set_progress(&self, id: TransferId, percent: u8) {
        self.update(id, |entry| {
            if entry.status.is_terminal() || entry.progress_percent == percent {
                return false;
            }
            entry.progress_percent = percent;
            true
        });
    }

    /// Marks an entry finished. Entries that are already terminal, such as ones
    /// failed by a cancel, keep their first outcome.
    fn finish(&self, id: TransferId, result: Result<(), QueueError>) {
        let reason = result.as_ref().err().map(|e| e.to_string());
        let snapshot = self.update(id, |entry| {
            if entry.status.is_terminal() {
                return false;
            }
            match &reason {
                None => {
                    entry.status = TransferStatus::Completed;
                    entry.progress_percent = 100;
                }
                Some(reason) => {
                    entry.status = TransferStatus::Failed;
                    entry.error_reason = Some(reason.clone());
                }
            }
            true
        });

        match (snapshot, &result) {
            (Some(snapshot), Ok(())) => {
                info!(id = %id, slot = snapshot.slot, "Transfer completed.")
            }
            (Some(snapshot), Err(QueueError::Transfer(e))) if e.is_storage_full() => {
                error!(id = %id, slot = snapshot.slot, err = e.to_string(), "Device storage may be full.")
            }
            (Some(snapshot), Err(e)) => {
                warn!(id = %id, slot = snapshot.slot, err = e.to_string(), "Transfer failed.")
            }
            (None, _) => {}
        }
    }

    /// Applies `change` to an entry and notifies the listener if it reports a change.
    fn update<F>(&self, id: TransferId, change: F) -> Option<EntrySnapshot>
    where
        F: FnOnce(&mut QueueEntry) -> bool,
    {
        let snapshot = {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .iter_mut()
                .find(|entry| entry.request.id == id)?;
            if !change(entry) {
                return None;
            }
            entry.snapshot()
        };
        self.notify(&snapshot);
        Some(snapshot)
    }

    fn notify(&self, snapshot: &EntrySnapshot) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(snapshot);
        }
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        TransferQueue::new(SlotRange::default(), Normalizer::default())
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, time::Duration};

    use super::*;
    use crate::{
        midi::mock,
        sds::{codec, ControlReply, DATA_PACKET_TAG},
        testutil::{eventually_async, write_wav},
    };

    fn short_audio(name: &str) -> ProcessedAudio {
        ProcessedAudio::from_samples(&[100i16; 400], 44100, name)
    }

    fn acking_connection() -> Result<(mock::Transport, DeviceConnection), Box<dyn Error>> {
        let transport = mock::Transport::get("mock-device");
        let connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        Ok((transport, connection))
    }

    /// Acknowledges the header, then keeps the first packet waiting.
    fn busy(message: &[u8]) -> Vec<Vec<u8>> {
        let reply = match mock::dump_frame(message) {
            Some((DATA_PACKET_TAG, 0)) => ControlReply::Wait(0),
            Some((_, packet_number)) => ControlReply::Ack(packet_number),
            None => return Vec::new(),
        };
        codec::encode_control_reply(reply).into_iter().collect()
    }

    #[test]
    fn test_enqueue_rejects_invalid_slot() {
        let queue = TransferQueue::new(SlotRange { first: 1, last: 10 }, Normalizer::default());
        for slot in [0, 11] {
            assert!(matches!(
                queue.enqueue(TransferRequest::ready(short_audio("a"), slot)),
                Err(QueueError::InvalidSlot { .. })
            ));
        }
        assert!(queue.entries().is_empty());
        assert!(queue
            .enqueue(TransferRequest::ready(short_audio("a"), 10))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_exclusivity() -> Result<(), Box<dyn Error>> {
        let (_, mut connection) = acking_connection()?;
        let queue = TransferQueue::default();

        let first = queue.enqueue(TransferRequest::ready(short_audio("a"), 3))?;
        assert!(matches!(
            queue.enqueue(TransferRequest::ready(short_audio("b"), 3)),
            Err(QueueError::SlotBusy(3))
        ));
        assert_eq!(queue.entries().len(), 1);
        queue.enqueue(TransferRequest::ready(short_audio("c"), 4))?;

        queue.run(&mut connection).await?;
        let entry = queue.entry(first).ok_or("missing entry")?;
        assert_eq!(entry.status, TransferStatus::Completed);
        assert_eq!(entry.progress_percent, 100);

        queue.enqueue(TransferRequest::ready(short_audio("b"), 3))?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_slot_can_be_reused() -> Result<(), Box<dyn Error>> {
        // The device refuses every header.
        let transport = mock::Transport::with_responder("mock-full", |message| {
            match mock::dump_frame(message) {
                Some((_, packet_number)) => {
                    codec::encode_control_reply(ControlReply::Cancel(packet_number))
                        .into_iter()
                        .collect()
                }
                None => Vec::new(),
            }
        });
        let mut connection = DeviceConnection::bound(Arc::new(transport))?;
        let queue = TransferQueue::default();

        let id = queue.enqueue(TransferRequest::ready(short_audio("a"), 7))?;
        queue.run(&mut connection).await?;

        let entry = queue.entry(id).ok_or("missing entry")?;
        assert_eq!(entry.status, TransferStatus::Failed);
        assert!(entry
            .error_reason
            .is_some_and(|reason| reason.contains("storage may be full")));

        queue.enqueue(TransferRequest::ready(short_audio("a"), 7))?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_is_sequential_and_continues_past_failures() -> Result<(), Box<dyn Error>> {
        let (transport, mut connection) = acking_connection()?;
        let queue = TransferQueue::default();

        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing.wav");
        let ids = [
            queue.enqueue(TransferRequest::ready(short_audio("a"), 1))?,
            queue.enqueue(TransferRequest::file(&missing, 2))?,
            queue.enqueue(TransferRequest::ready(short_audio("c"), 3))?,
        ];
        queue.run(&mut connection).await?;

        let statuses = ids
            .iter()
            .map(|id| queue.entry(*id).map(|entry| entry.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                Some(TransferStatus::Completed),
                Some(TransferStatus::Failed),
                Some(TransferStatus::Completed),
            ]
        );

        // Slot 1's frames all precede slot 3's.
        let headers = transport
            .sent()
            .iter()
            .filter_map(|message| match message.as_slice() {
                [0xF0, 0x7E, _, 0x01, slot, ..] => Some(*slot),
                _ => None,
            })
            .collect::<Vec<u8>>();
        assert_eq!(headers, vec![1, 3]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_entries_are_processed() -> Result<(), Box<dyn Error>> {
        let (transport, mut connection) = acking_connection()?;
        let queue = TransferQueue::default();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            queue.set_listener(move |snapshot| seen.lock().push(snapshot.status));
        }

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("snare.wav");
        write_wav(&path, vec![vec![0.5f32; 441]], 44100)?;

        let id = queue
            .quick_enqueue_and_run(TransferRequest::file(&path, 5), &mut connection)
            .await?;
        let entry = queue.entry(id).ok_or("missing entry")?;
        assert_eq!(entry.source_name, "snare.wav");
        assert_eq!(entry.status, TransferStatus::Completed);

        let mut statuses = seen.lock().clone();
        statuses.dedup();
        assert_eq!(
            statuses,
            vec![
                TransferStatus::Pending,
                TransferStatus::Processing,
                TransferStatus::Transferring,
                TransferStatus::Completed,
            ]
        );

        // One header plus a full second of packets.
        assert_eq!(transport.sent().len(), 1 + 1103);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_connection() -> Result<(), Box<dyn Error>> {
        let queue = TransferQueue::default();
        let id = queue.enqueue(TransferRequest::ready(short_audio("a"), 1))?;

        let mut connection = DeviceConnection::new();
        assert!(matches!(
            queue.run(&mut connection).await,
            Err(QueueError::Transfer(TransferError::TransportUnavailable))
        ));
        assert_eq!(
            queue.entry(id).map(|entry| entry.status),
            Some(TransferStatus::Pending)
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() -> Result<(), Box<dyn Error>> {
        let transport = mock::Transport::with_responder("mock-busy", busy);
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        let queue = TransferQueue::default();

        let first = queue.enqueue(TransferRequest::ready(short_audio("a"), 1))?;
        let second = queue.enqueue(TransferRequest::ready(short_audio("b"), 2))?;

        let (result, _) = tokio::join!(queue.run(&mut connection), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            queue.cancel();
        });
        result?;

        for id in [first, second] {
            let entry = queue.entry(id).ok_or("missing entry")?;
            assert_eq!(entry.status, TransferStatus::Failed);
            assert_eq!(entry.error_reason.as_deref(), Some("cancelled"));
        }

        // The second entry never reached the wire.
        assert!(transport
            .sent()
            .iter()
            .all(|message| !matches!(message.as_slice(), [0xF0, 0x7E, _, 0x01, 2, ..])));

        assert_eq!(queue.clear_finished(), 2);
        assert!(queue.entries().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_are_visible_while_running() -> Result<(), Box<dyn Error>> {
        let mut connection =
            DeviceConnection::bound(Arc::new(mock::Transport::with_responder("mock-busy", busy)))?;
        let queue = TransferQueue::default();
        let id = queue.enqueue(TransferRequest::ready(short_audio("a"), 1))?;

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run(&mut connection).await })
        };

        eventually_async(
            || {
                let queue = queue.clone();
                async move {
                    queue.entry(id).map(|entry| entry.status) == Some(TransferStatus::Transferring)
                }
            },
            "Transfer never started",
        )
        .await;

        assert!(matches!(
            queue.enqueue(TransferRequest::ready(short_audio("b"), 1)),
            Err(QueueError::SlotBusy(1))
        ));
        assert_eq!(queue.entries().len(), 1);

        // A second run while the first is active returns straight away.
        let other = mock::Transport::silent("mock-other");
        let mut other_connection = DeviceConnection::bound(Arc::new(other.clone()))?;
        queue.run(&mut other_connection).await?;
        assert!(other.sent().is_empty());

        queue.cancel();
        runner.await??;
        assert_eq!(
            queue.entry(id).map(|entry| entry.status),
            Some(TransferStatus::Failed)
        );
        Ok(())
    }
}
