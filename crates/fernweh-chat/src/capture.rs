//! Audio capture session lifecycle.
//!
//! A recording in progress must survive screen transitions, so the session
//! object owns the device exclusively and releases it on every exit path:
//! cancel, finalize, or the hosting scope dropping it mid-recording.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use fernweh_shared::error::CaptureError;
use fernweh_shared::types::AttachmentRef;

/// Platform recording backend. The real implementation wraps the device
/// audio APIs; tests and previews use [`InMemoryCaptureDevice`].
pub trait CaptureDevice: Send + Sync + 'static {
    /// Open the input and start recording.
    fn begin(&self) -> Result<(), CaptureError>;
    /// Stop recording and produce the uploaded-attachment reference.
    fn finish(&self) -> Result<AttachmentRef, CaptureError>;
    /// Stop recording and drop whatever was captured.
    fn abort(&self);
}

/// Device-wide exclusivity token: at most one live capture per device.
#[derive(Clone, Default)]
pub struct CaptureSlot {
    busy: Arc<AtomicBool>,
}

impl CaptureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Recording,
    Cancelled,
    Finalizing,
    Attached,
}

/// One in-progress voice recording.
pub struct AudioCaptureSession {
    slot: CaptureSlot,
    device: Arc<dyn CaptureDevice>,
    started_at: Instant,
    state: CaptureState,
    released: bool,
}

impl std::fmt::Debug for AudioCaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureSession")
            .field("started_at", &self.started_at)
            .field("state", &self.state)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl AudioCaptureSession {
    /// Begin recording. Fails fast with `AlreadyActive` while another
    /// capture holds the slot; a second recording never queues.
    pub fn start(
        slot: &CaptureSlot,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<Self, CaptureError> {
        if slot.busy.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyActive);
        }
        if let Err(err) = device.begin() {
            slot.busy.store(false, Ordering::SeqCst);
            return Err(err);
        }
        debug!("Audio capture started");
        Ok(Self {
            slot: slot.clone(),
            device,
            started_at: Instant::now(),
            state: CaptureState::Recording,
            released: false,
        })
    }

    /// Recording time so far, from a monotonic clock independent of any
    /// UI animation timer.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed().as_secs()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Abandon the recording; produces no message.
    pub fn cancel(mut self) {
        self.state = CaptureState::Cancelled;
        self.device.abort();
        self.release();
        debug!("Audio capture cancelled");
    }

    /// Stop recording and hand back the attachment reference plus the
    /// recorded duration, for `ChatSession::send_audio`.
    pub fn finalize(mut self) -> Result<(AttachmentRef, Duration), CaptureError> {
        self.state = CaptureState::Finalizing;
        let elapsed = self.elapsed();
        let result = self.device.finish();
        self.release();
        match result {
            Ok(attachment) => {
                self.state = CaptureState::Attached;
                debug!(seconds = elapsed.as_secs(), "Audio capture finalized");
                Ok((attachment, elapsed))
            }
            Err(err) => Err(err),
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.slot.busy.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        // The hosting screen may die without cancel/finalize; the device
        // and the slot must come back regardless.
        if !self.released {
            self.device.abort();
            self.release();
            debug!("Audio capture released on drop");
        }
    }
}

/// Capture backend that records nothing and mints an opaque reference,
/// for tests and headless use.
#[derive(Default)]
pub struct InMemoryCaptureDevice;

impl CaptureDevice for InMemoryCaptureDevice {
    fn begin(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn finish(&self) -> Result<AttachmentRef, CaptureError> {
        Ok(AttachmentRef::new(format!("mem:{}", Uuid::new_v4())))
    }

    fn abort(&self) {}
}
