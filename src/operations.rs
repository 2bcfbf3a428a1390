//! Operations manager: a single background worker thread that drains a
//! FIFO queue of download/delete operations against the device façade,
//! reporting progress through a caller-supplied callback.
//!
//! Because the façade already serializes all USB access through the
//! session, running exactly one worker thread here makes "no two
//! operations ever issue concurrent USB I/O" structural rather than
//! something callers have to remember.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::warn;
use uuid::Uuid;

use crate::device::DeviceOps;
use crate::error::HiDockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Download,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub filename: String,
    pub status: OperationStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl Operation {
    fn new(id: Uuid, kind: OperationKind, filename: String) -> Self {
        Self {
            id,
            kind,
            filename,
            status: OperationStatus::Pending,
            progress: 0.0,
            error_message: None,
            started_at: None,
            finished_at: None,
        }
    }
}

type UpdateCallback = Arc<dyn Fn(Operation) + Send + Sync>;

struct QueuedOperation {
    id: Uuid,
    kind: OperationKind,
    filename: String,
    dest_dir: Option<PathBuf>,
    on_update: UpdateCallback,
}

enum WorkerMessage {
    Enqueue(QueuedOperation),
    Cancel(Uuid),
}

/// Shared view of every operation the manager knows about, keyed by id.
/// The worker thread is the sole writer; `OperationsManager` only reads it
/// back for the query methods.
type OperationTable = Arc<Mutex<HashMap<Uuid, Operation>>>;

pub struct OperationsManager {
    cmd_tx: mpsc::Sender<WorkerMessage>,
    operations: OperationTable,
}

impl OperationsManager {
    pub fn new(device: impl DeviceOps + 'static) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let operations: OperationTable = Arc::new(Mutex::new(HashMap::new()));
        let cancelled: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));

        let worker_operations = Arc::clone(&operations);
        let worker_cancelled = Arc::clone(&cancelled);
        std::thread::spawn(move || run_worker(device, cmd_rx, worker_operations, worker_cancelled));

        Self { cmd_tx, operations }
    }

    /// Enqueue one `Download` operation per filename, returning the
    /// assigned operation ids in enqueue order.
    pub fn queue_batch_download(
        &self,
        filenames: &[String],
        dest_dir: impl AsRef<Path>,
        on_update: impl Fn(Operation) + Send + Sync + 'static,
    ) -> Vec<Uuid> {
        let on_update: UpdateCallback = Arc::new(on_update);
        let dest_dir = dest_dir.as_ref().to_path_buf();
        filenames
            .iter()
            .map(|filename| {
                self.enqueue(
                    OperationKind::Download,
                    filename.clone(),
                    Some(dest_dir.clone()),
                    Arc::clone(&on_update),
                )
            })
            .collect()
    }

    /// Enqueue one `Delete` operation per filename, returning the assigned
    /// operation ids in enqueue order.
    pub fn queue_batch_delete(
        &self,
        filenames: &[String],
        on_update: impl Fn(Operation) + Send + Sync + 'static,
    ) -> Vec<Uuid> {
        let on_update: UpdateCallback = Arc::new(on_update);
        filenames
            .iter()
            .map(|filename| {
                self.enqueue(OperationKind::Delete, filename.clone(), None, Arc::clone(&on_update))
            })
            .collect()
    }

    fn enqueue(
        &self,
        kind: OperationKind,
        filename: String,
        dest_dir: Option<PathBuf>,
        on_update: UpdateCallback,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let operation = Operation::new(id, kind, filename.clone());
        self.operations.lock().unwrap().insert(id, operation.clone());
        on_update(operation);

        let queued = QueuedOperation {
            id,
            kind,
            filename,
            dest_dir,
            on_update,
        };
        if self.cmd_tx.send(WorkerMessage::Enqueue(queued)).is_err() {
            warn!("operations worker thread is gone, operation {id} will never run");
        }
        id
    }

    /// Cancel a pending or in-progress operation. Returns `false` if `op_id`
    /// is unknown or already in a terminal state.
    pub fn cancel_operation(&self, op_id: Uuid) -> bool {
        let active = matches!(
            self.operations.lock().unwrap().get(&op_id).map(|op| op.status),
            Some(OperationStatus::Pending) | Some(OperationStatus::InProgress)
        );
        if active && self.cmd_tx.send(WorkerMessage::Cancel(op_id)).is_err() {
            warn!("operations worker thread is gone, cancel of {op_id} has no effect");
        }
        active
    }

    pub fn get_all_active_operations(&self) -> Vec<Operation> {
        self.operations
            .lock()
            .unwrap()
            .values()
            .filter(|op| matches!(op.status, OperationStatus::Pending | OperationStatus::InProgress))
            .cloned()
            .collect()
    }

    pub fn is_file_operation_active(&self, filename: &str, kind: OperationKind) -> bool {
        self.operations.lock().unwrap().values().any(|op| {
            op.filename == filename
                && op.kind == kind
                && matches!(op.status, OperationStatus::Pending | OperationStatus::InProgress)
        })
    }
}

fn run_worker(
    mut device: impl DeviceOps,
    cmd_rx: mpsc::Receiver<WorkerMessage>,
    operations: OperationTable,
    cancelled: Arc<Mutex<HashSet<Uuid>>>,
) {
    let mut queue: VecDeque<QueuedOperation> = VecDeque::new();

    loop {
        let msg = if queue.is_empty() {
            match cmd_rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            }
        } else {
            match cmd_rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => {
                    let op = queue.pop_front().expect("queue non-empty");
                    process_operation(&mut device, op, &operations, &cancelled);
                    continue;
                }
                Err(TryRecvError::Disconnected) => return,
            }
        };

        match msg {
            WorkerMessage::Enqueue(op) => queue.push_back(op),
            WorkerMessage::Cancel(id) => {
                if let Some(pos) = queue.iter().position(|op| op.id == id) {
                    let op = queue.remove(pos).expect("position just found");
                    finish(&operations, id, OperationStatus::Cancelled, None, &op.on_update);
                } else {
                    cancelled.lock().unwrap().insert(id);
                }
            }
        }
    }
}

fn process_operation(
    device: &mut impl DeviceOps,
    op: QueuedOperation,
    operations: &OperationTable,
    cancelled: &Arc<Mutex<HashSet<Uuid>>>,
) {
    let QueuedOperation {
        id,
        kind,
        filename,
        dest_dir,
        on_update,
    } = op;

    {
        let mut table = operations.lock().unwrap();
        if let Some(entry) = table.get_mut(&id) {
            entry.status = OperationStatus::InProgress;
            entry.started_at = Some(SystemTime::now());
            on_update(entry.clone());
        }
    }

    let result = match kind {
        OperationKind::Download => {
            let dest_dir = dest_dir.expect("download operations always carry a destination");
            let mut on_progress = |received: u64, total: Option<u64>| -> bool {
                if cancelled.lock().unwrap().contains(&id) {
                    return false;
                }
                let progress = total.filter(|&t| t > 0).map(|t| received as f64 / t as f64);
                let mut table = operations.lock().unwrap();
                if let Some(entry) = table.get_mut(&id) {
                    if let Some(progress) = progress {
                        entry.progress = progress.min(1.0);
                    }
                    on_update(entry.clone());
                }
                true
            };
            device
                .download_recording(&filename, &dest_dir, None, &mut on_progress)
                .map(|_| ())
        }
        OperationKind::Delete => {
            if cancelled.lock().unwrap().contains(&id) {
                Err(HiDockError::OperationCancelled)
            } else {
                device.delete_recording(&filename).map(|_| ())
            }
        }
    };

    cancelled.lock().unwrap().remove(&id);

    match result {
        Ok(()) => finish(operations, id, OperationStatus::Completed, None, &on_update),
        Err(HiDockError::OperationCancelled) => {
            finish(operations, id, OperationStatus::Cancelled, None, &on_update)
        }
        Err(err) => finish(operations, id, OperationStatus::Failed, Some(err.to_string()), &on_update),
    }
}

fn finish(
    operations: &OperationTable,
    id: Uuid,
    status: OperationStatus,
    error_message: Option<String>,
    on_update: &UpdateCallback,
) {
    let mut table = operations.lock().unwrap();
    if let Some(entry) = table.get_mut(&id) {
        entry.status = status;
        entry.finished_at = Some(SystemTime::now());
        if status == OperationStatus::Completed {
            entry.progress = 1.0;
        }
        entry.error_message = error_message;
        on_update(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::Condvar;
    use std::time::Duration;

    struct FakeDevice {
        gate: Option<Arc<(Mutex<bool>, Condvar)>>,
        download_calls: Arc<Mutex<Vec<String>>>,
        fail_delete: bool,
    }

    impl DeviceOps for FakeDevice {
        fn download_recording(
            &mut self,
            filename: &str,
            _dest_dir: &Path,
            _expected_size: Option<u32>,
            on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
        ) -> Result<PathBuf> {
            if let Some(gate) = &self.gate {
                let (lock, cvar) = &**gate;
                let mut released = lock.lock().unwrap();
                while !*released {
                    released = cvar.wait(released).unwrap();
                }
            }
            self.download_calls.lock().unwrap().push(filename.to_string());
            on_progress(10, Some(10));
            Ok(PathBuf::from(filename))
        }

        fn delete_recording(&mut self, _filename: &str) -> Result<crate::commands::DeleteOutcome> {
            if self.fail_delete {
                Err(HiDockError::NotSupported)
            } else {
                Ok(crate::commands::DeleteOutcome::Deleted)
            }
        }
    }

    fn recv_until_terminal(rx: &mpsc::Receiver<Operation>, id: Uuid) -> Operation {
        loop {
            let op = rx.recv_timeout(Duration::from_secs(5)).expect("operation update");
            if op.id == id
                && matches!(
                    op.status,
                    OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
                )
            {
                return op;
            }
        }
    }

    #[test]
    fn queued_downloads_complete_in_enqueue_order() {
        let device = FakeDevice {
            gate: None,
            download_calls: Arc::new(Mutex::new(Vec::new())),
            fail_delete: false,
        };
        let calls = Arc::clone(&device.download_calls);
        let manager = OperationsManager::new(device);

        let (tx, rx) = mpsc::channel();
        let ids = manager.queue_batch_download(
            &["a.wav".to_string(), "b.wav".to_string()],
            std::env::temp_dir(),
            move |op| {
                let _ = tx.send(op);
            },
        );

        let last = recv_until_terminal(&rx, ids[1]);
        assert_eq!(last.status, OperationStatus::Completed);
        assert_eq!(last.progress, 1.0);
        assert_eq!(*calls.lock().unwrap(), vec!["a.wav".to_string(), "b.wav".to_string()]);
    }

    #[test]
    fn cancelling_a_pending_operation_keeps_it_from_ever_running() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let device = FakeDevice {
            gate: Some(Arc::clone(&gate)),
            download_calls: Arc::new(Mutex::new(Vec::new())),
            fail_delete: false,
        };
        let calls = Arc::clone(&device.download_calls);
        let manager = OperationsManager::new(device);

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let first = manager.queue_batch_download(&["a.wav".to_string()], std::env::temp_dir(), move |op| {
            let _ = tx.send(op);
        });
        let second = manager.queue_batch_download(&["b.wav".to_string()], std::env::temp_dir(), move |op| {
            let _ = tx2.send(op);
        });

        assert!(manager.cancel_operation(second[0]));

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        let done_first = recv_until_terminal(&rx, first[0]);
        assert_eq!(done_first.status, OperationStatus::Completed);
        let done_second = recv_until_terminal(&rx, second[0]);
        assert_eq!(done_second.status, OperationStatus::Cancelled);
        assert_eq!(*calls.lock().unwrap(), vec!["a.wav".to_string()]);
    }

    #[test]
    fn is_file_operation_active_reflects_pending_and_in_progress_only() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let device = FakeDevice {
            gate: Some(Arc::clone(&gate)),
            download_calls: Arc::new(Mutex::new(Vec::new())),
            fail_delete: false,
        };
        let manager = OperationsManager::new(device);

        let ids = manager.queue_batch_download(&["a.wav".to_string()], std::env::temp_dir(), |_| {});
        assert!(manager.is_file_operation_active("a.wav", OperationKind::Download));

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        loop {
            if !manager.is_file_operation_active("a.wav", OperationKind::Download) {
                break;
            }
        }
        assert!(!manager
            .get_all_active_operations()
            .iter()
            .any(|op| op.id == ids[0]));
    }

    #[test]
    fn failed_delete_reports_error_message() {
        let device = FakeDevice {
            gate: None,
            download_calls: Arc::new(Mutex::new(Vec::new())),
            fail_delete: true,
        };
        let manager = OperationsManager::new(device);

        let (tx, rx) = mpsc::channel();
        let ids = manager.queue_batch_delete(&["a.wav".to_string()], move |op| {
            let _ = tx.send(op);
        });

        let done = recv_until_terminal(&rx, ids[0]);
        assert_eq!(done.status, OperationStatus::Failed);
        assert!(done.error_message.is_some());
    }
}
