//! Source lifecycle management.
//!
//! The `SourceManager` owns the single process-wide video source. At most one
//! reader (file or camera) is open at any time. Opens are serialised by a
//! transition lock; state changes run under a second, short-held lock so
//! `stop`, `state` and lease checks never wait on camera or file I/O.
//!
//! Streams do not own the reader. They hold a `SourceLease` naming the kind
//! and generation they attached to and pull frames through the manager. Every
//! transition bumps the generation, so a stream attached to an old source
//! sees end of stream instead of frames from its replacement.
//!
//! A reader retired while a frame read is in flight is released by the
//! reading thread once the read returns. The next open waits for that
//! release, so release always precedes open.
//!
//! The activity flags govern streaming. They are written only through the
//! manager; pipelines and notifiers read them. Running out of frames does
//! not touch them: only `stop`, `abort` and a new open clear a flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};

use anyhow::{anyhow, Result};

use crate::error::StreamError;
use crate::frame::Frame;
use crate::ingest::{CameraBackend, CameraSettings, FrameReader, SourceOpener};

/// Which kind of source a stream is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Camera,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Camera => "camera",
        }
    }
}

/// Snapshot of the active source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    File { path: String },
    Camera { device: String },
}

impl SourceState {
    pub fn kind(&self) -> Option<SourceKind> {
        match self {
            SourceState::Idle => None,
            SourceState::File { .. } => Some(SourceKind::File),
            SourceState::Camera { .. } => Some(SourceKind::Camera),
        }
    }
}

/// Governing flags for the file and camera streams.
#[derive(Debug, Default)]
pub struct ActivityFlags {
    file: AtomicBool,
    camera: AtomicBool,
}

impl ActivityFlags {
    pub fn file_active(&self) -> bool {
        self.file.load(Ordering::SeqCst)
    }

    pub fn camera_active(&self) -> bool {
        self.camera.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::File => self.file_active(),
            SourceKind::Camera => self.camera_active(),
        }
    }

    /// True while either stream is active. Governs the event notifier.
    pub fn any_active(&self) -> bool {
        self.file_active() || self.camera_active()
    }

    fn set(&self, kind: SourceKind, active: bool) {
        match kind {
            SourceKind::File => self.file.store(active, Ordering::SeqCst),
            SourceKind::Camera => self.camera.store(active, Ordering::SeqCst),
        }
    }

    fn clear(&self) {
        self.file.store(false, Ordering::SeqCst);
        self.camera.store(false, Ordering::SeqCst);
    }
}

/// Plain copy of the activity flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    pub file_active: bool,
    pub camera_active: bool,
}

/// A stream's claim on the source it attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLease {
    kind: SourceKind,
    generation: u64,
}

impl SourceLease {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

/// One opened reader, shared between the manager slot and in-flight reads.
/// The reader is released exactly once: explicitly by the next open, or when
/// the last holder drops the handle.
struct SourceHandle {
    reader: Mutex<Option<Box<dyn FrameReader>>>,
}

impl SourceHandle {
    fn new(reader: Box<dyn FrameReader>) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn FrameReader>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until any in-flight read returns.
    fn release(&self) {
        release_reader(&mut self.lock());
    }

    /// Not yet released. A handle busy in a read counts as open.
    fn is_open(&self) -> bool {
        match self.reader.try_lock() {
            Ok(reader) => reader.is_some(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
            Err(TryLockError::WouldBlock) => true,
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        release_reader(self.reader.get_mut().unwrap_or_else(PoisonError::into_inner));
    }
}

fn release_reader(slot: &mut Option<Box<dyn FrameReader>>) {
    if let Some(mut reader) = slot.take() {
        log::info!("SourceManager: releasing {}", reader.describe());
        reader.release();
    }
}

struct Inner {
    state: SourceState,
    handle: Option<Arc<SourceHandle>>,
    generation: u64,
    /// Handles torn down while a read may still hold them.
    retiring: Vec<Weak<SourceHandle>>,
}

pub struct SourceManager {
    opener: Arc<dyn SourceOpener>,
    camera: CameraSettings,
    transition: Mutex<()>,
    inner: Mutex<Inner>,
    flags: Arc<ActivityFlags>,
}

impl SourceManager {
    pub fn new(opener: Arc<dyn SourceOpener>, camera: CameraSettings) -> Self {
        Self {
            opener,
            camera,
            transition: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SourceState::Idle,
                handle: None,
                generation: 0,
                retiring: Vec::new(),
            }),
            flags: Arc::new(ActivityFlags::default()),
        }
    }

    pub fn camera_settings(&self) -> &CameraSettings {
        &self.camera
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Transitions never leave Inner half-updated, so a poisoned lock is
        // still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detach the active handle and return to Idle. Caller holds the lock and
    /// drops the returned handle after unlocking; the reader is released then,
    /// or by the in-flight read still holding it.
    fn teardown(inner: &mut Inner) -> Option<Arc<SourceHandle>> {
        inner.state = SourceState::Idle;
        inner.generation += 1;
        let handle = inner.handle.take()?;
        inner.retiring.retain(|weak| weak.strong_count() > 0);
        inner.retiring.push(Arc::downgrade(&handle));
        Some(handle)
    }

    /// Clear the flags, detach the active source, and wait until every
    /// retired reader is released. Caller holds the transition lock.
    fn quiesce(&self) {
        let (old, retiring) = {
            let mut inner = self.lock();
            self.flags.clear();
            let old = Self::teardown(&mut inner);
            (old, std::mem::take(&mut inner.retiring))
        };
        drop(old);
        for handle in retiring.iter().filter_map(Weak::upgrade) {
            handle.release();
        }
    }

    fn install(&self, reader: Box<dyn FrameReader>, state: SourceState) {
        let kind = state.kind();
        let mut inner = self.lock();
        inner.handle = Some(Arc::new(SourceHandle::new(reader)));
        inner.state = state;
        inner.generation += 1;
        if let Some(kind) = kind {
            self.flags.set(kind, true);
        }
    }

    /// Make a local file the active source.
    ///
    /// Any active source is released before the file is opened. On failure
    /// the manager is left Idle.
    pub fn open_file(&self, path: &str) -> Result<(), StreamError> {
        let _transition = self.lock_transition();
        self.quiesce();

        let reader = self.opener.open_file(path).map_err(|err| {
            log::warn!("SourceManager: cannot open file {}: {:#}", path, err);
            StreamError::unavailable(format!("file {}", path), &err)
        })?;

        self.install(
            reader,
            SourceState::File {
                path: path.to_string(),
            },
        );
        log::info!("SourceManager: file source active: {}", path);
        Ok(())
    }

    /// Make the configured camera the active source.
    ///
    /// Tries the preferred capture backend, then the fallback. The opened
    /// camera must deliver one probe frame; otherwise the partial handle is
    /// released and the manager is left Idle.
    pub fn open_camera(&self) -> Result<(), StreamError> {
        let _transition = self.lock_transition();
        self.quiesce();

        let what = format!("camera {}", self.camera.device);
        let mut reader = self.open_camera_reader().map_err(|err| {
            log::warn!("SourceManager: cannot open {}: {:#}", what, err);
            StreamError::unavailable(what.as_str(), &err)
        })?;

        let probe = match reader.read_frame() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(anyhow!("camera delivered no probe frame")),
            Err(err) => Err(err.context("camera probe frame failed")),
        };
        if let Err(err) = probe {
            log::warn!("SourceManager: {} failed probe: {:#}", what, err);
            reader.release();
            return Err(StreamError::unavailable(what, &err));
        }

        self.install(
            reader,
            SourceState::Camera {
                device: self.camera.device.clone(),
            },
        );
        log::info!("SourceManager: camera source active: {}", self.camera.device);
        Ok(())
    }

    fn open_camera_reader(&self) -> Result<Box<dyn FrameReader>> {
        match self
            .opener
            .open_camera(CameraBackend::Preferred, &self.camera)
        {
            Ok(reader) => Ok(reader),
            Err(preferred) => {
                log::warn!(
                    "SourceManager: preferred camera backend failed for {}: {:#}; trying fallback",
                    self.camera.device,
                    preferred
                );
                self.opener
                    .open_camera(CameraBackend::Fallback, &self.camera)
                    .map_err(|fallback| {
                        fallback.context(format!("preferred backend also failed: {:#}", preferred))
                    })
            }
        }
    }

    /// Release the active source and clear both flags. Safe to call repeatedly.
    ///
    /// Never waits on a read in progress: a reader busy in a read is released
    /// by that read as soon as it returns.
    pub fn stop(&self) {
        let (was, old) = {
            let mut inner = self.lock();
            let was = inner.state.clone();
            self.flags.clear();
            (was, Self::teardown(&mut inner))
        };
        drop(old);
        if was != SourceState::Idle {
            log::info!("SourceManager: stopped {:?}", was);
        }
    }

    /// Clear both flags without touching the reader. Running streams notice on
    /// their next frame and release the source on their way out.
    pub fn abort(&self) {
        self.flags.clear();
        log::info!("SourceManager: abort requested");
    }

    pub fn set_file_active(&self, active: bool) {
        self.flags.set(SourceKind::File, active);
    }

    pub fn set_camera_active(&self, active: bool) {
        self.flags.set(SourceKind::Camera, active);
    }

    pub fn flags(&self) -> FlagSnapshot {
        FlagSnapshot {
            file_active: self.flags.file_active(),
            camera_active: self.flags.camera_active(),
        }
    }

    /// Shared handle on the activity flags for notifiers.
    pub fn activity(&self) -> Arc<ActivityFlags> {
        Arc::clone(&self.flags)
    }

    /// Attach to the current source if it is of `kind`.
    pub fn lease(&self, kind: SourceKind) -> Option<SourceLease> {
        let inner = self.lock();
        if inner.state.kind() == Some(kind) && inner.handle.is_some() {
            Some(SourceLease {
                kind,
                generation: inner.generation,
            })
        } else {
            None
        }
    }

    /// True while `lease` still names the active source.
    pub(crate) fn is_current(&self, lease: &SourceLease) -> bool {
        let inner = self.lock();
        inner.generation == lease.generation && inner.handle.is_some()
    }

    /// Pull one frame for `lease`. A stale lease sees end of stream, and so
    /// does a read whose source was replaced or stopped while it ran.
    ///
    /// The manager lock is not held during the read.
    pub fn read_frame(&self, lease: &SourceLease) -> Result<Option<Frame>> {
        let handle = {
            let inner = self.lock();
            match &inner.handle {
                Some(handle) if inner.generation == lease.generation => Arc::clone(handle),
                _ => return Ok(None),
            }
        };
        let frame = match handle.lock().as_mut() {
            Some(reader) => reader.read_frame()?,
            None => return Ok(None),
        };
        if !self.is_current(lease) {
            return Ok(None);
        }
        Ok(frame)
    }

    /// End-of-stream cleanup for `lease`: release the reader and go Idle. The
    /// governing flag stays set so queued events still reach subscribers.
    /// No-op when the lease is stale.
    pub fn finish(&self, lease: &SourceLease) -> bool {
        let old = {
            let mut inner = self.lock();
            if inner.generation != lease.generation {
                return false;
            }
            Self::teardown(&mut inner)
        };
        drop(old);
        true
    }

    pub fn state(&self) -> SourceState {
        self.lock().state.clone()
    }

    /// Readers not yet released: the active one plus any retired reader still
    /// finishing a read.
    pub fn open_handles(&self) -> usize {
        let inner = self.lock();
        let active = inner.handle.iter().filter(|handle| handle.is_open()).count();
        let retiring = inner
            .retiring
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|handle| handle.is_open())
            .count();
        active + retiring
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        drop(Self::teardown(inner));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::ingest::SystemOpener;

    fn manager(device: &str) -> SourceManager {
        SourceManager::new(
            Arc::new(SystemOpener),
            CameraSettings {
                device: device.to_string(),
                width: 16,
                height: 12,
                fps: 0,
                fourcc: "MJPG".to_string(),
            },
        )
    }

    #[test]
    fn open_file_sets_state_and_flags() -> Result<()> {
        let manager = manager("stub://cam");
        manager.open_file("stub://clip?frames=2")?;
        assert_eq!(
            manager.state(),
            SourceState::File {
                path: "stub://clip?frames=2".to_string()
            }
        );
        assert_eq!(
            manager.flags(),
            FlagSnapshot {
                file_active: true,
                camera_active: false
            }
        );
        assert_eq!(manager.open_handles(), 1);
        Ok(())
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let manager = manager("stub://cam");
        let err = manager.open_file("/definitely/not/here.mjpg").unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable { .. }));
        assert_eq!(manager.state(), SourceState::Idle);
        assert_eq!(manager.open_handles(), 0);
    }

    #[test]
    fn dead_camera_fails_probe_and_stays_idle() {
        let manager = manager("stub://dead");
        let err = manager.open_camera().unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("probe"));
        assert_eq!(manager.state(), SourceState::Idle);
        assert_eq!(manager.open_handles(), 0);
        assert!(!manager.flags().camera_active);
    }

    #[test]
    fn camera_falls_back_when_preferred_backend_fails() -> Result<()> {
        let manager = manager("stub://cam?preferred=fail");
        manager.open_camera()?;
        assert!(manager.flags().camera_active);
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let manager = manager("stub://cam");
        manager.open_camera()?;
        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), SourceState::Idle);
        assert_eq!(manager.flags(), FlagSnapshot::default());
        assert_eq!(manager.open_handles(), 0);
        Ok(())
    }

    #[test]
    fn abort_clears_flags_but_keeps_reader() -> Result<()> {
        let manager = manager("stub://cam");
        manager.open_file("stub://clip")?;
        manager.abort();
        assert_eq!(manager.flags(), FlagSnapshot::default());
        assert_eq!(manager.open_handles(), 1);
        Ok(())
    }

    #[test]
    fn stale_lease_sees_end_of_stream() -> Result<()> {
        let manager = manager("stub://cam");
        manager.open_file("stub://first?frames=5")?;
        let old = manager.lease(SourceKind::File).expect("file lease");
        manager.open_file("stub://second?frames=5")?;
        assert!(!manager.is_current(&old));
        assert!(manager.read_frame(&old)?.is_none());
        assert!(!manager.finish(&old));
        // the new source is untouched by the stale finish
        assert_eq!(manager.open_handles(), 1);
        assert!(manager.flags().file_active);
        Ok(())
    }

    #[test]
    fn finish_releases_but_keeps_flag() -> Result<()> {
        let manager = manager("stub://cam");
        manager.open_file("stub://clip?frames=1")?;
        let lease = manager.lease(SourceKind::File).expect("file lease");
        assert!(manager.lease(SourceKind::Camera).is_none());
        assert!(manager.read_frame(&lease)?.is_some());
        assert!(manager.read_frame(&lease)?.is_none());
        assert!(manager.finish(&lease));
        assert_eq!(manager.state(), SourceState::Idle);
        assert_eq!(manager.open_handles(), 0);
        // only stop, abort or a new open clear the flag
        assert!(manager.flags().file_active);
        manager.abort();
        assert!(!manager.flags().file_active);
        Ok(())
    }

    /// Reader whose first read blocks until the test lets it go.
    struct GatedReader {
        name: String,
        entered: Option<mpsc::Sender<()>>,
        gate: Option<mpsc::Receiver<()>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FrameReader for GatedReader {
        fn describe(&self) -> String {
            self.name.clone()
        }

        fn read_frame(&mut self) -> Result<Option<Frame>> {
            if let Some(entered) = self.entered.take() {
                let _ = entered.send(());
            }
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            Ok(Some(Frame::rgb(vec![0; 12], 2, 2)?))
        }

        fn release(&mut self) {
            self.log.lock().unwrap().push(format!("release {}", self.name));
        }
    }

    /// Hands the gate to the first file it opens.
    struct GatedOpener {
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl GatedOpener {
        fn new(entered: mpsc::Sender<()>, gate: mpsc::Receiver<()>) -> Self {
            Self {
                gate: Mutex::new(Some((entered, gate))),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl SourceOpener for GatedOpener {
        fn open_file(&self, path: &str) -> Result<Box<dyn FrameReader>> {
            self.log.lock().unwrap().push(format!("open {}", path));
            let (entered, gate) = match self.gate.lock().unwrap().take() {
                Some((entered, gate)) => (Some(entered), Some(gate)),
                None => (None, None),
            };
            Ok(Box::new(GatedReader {
                name: path.to_string(),
                entered,
                gate,
                log: Arc::clone(&self.log),
            }))
        }

        fn open_camera(
            &self,
            _backend: CameraBackend,
            _settings: &CameraSettings,
        ) -> Result<Box<dyn FrameReader>> {
            Err(anyhow!("no camera"))
        }
    }

    type Gated = (
        Arc<SourceManager>,
        Arc<Mutex<Vec<String>>>,
        mpsc::Receiver<()>,
        mpsc::Sender<()>,
    );

    fn gated_manager() -> Gated {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let opener = GatedOpener::new(entered_tx, gate_rx);
        let log = Arc::clone(&opener.log);
        let manager = Arc::new(SourceManager::new(
            Arc::new(opener),
            CameraSettings::default(),
        ));
        (manager, log, entered_rx, gate_tx)
    }

    #[test]
    fn stop_does_not_wait_for_blocked_read() -> Result<()> {
        let (manager, log, entered, gate) = gated_manager();
        manager.open_file("slow")?;
        let lease = manager.lease(SourceKind::File).expect("file lease");

        let reader = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.read_frame(&lease).map(|frame| frame.is_some()))
        };
        entered.recv()?;

        let started = Instant::now();
        assert_eq!(
            manager.state(),
            SourceState::File {
                path: "slow".to_string()
            }
        );
        manager.stop();
        assert_eq!(manager.state(), SourceState::Idle);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(manager.flags(), FlagSnapshot::default());
        // the busy reader is released once its read returns
        assert_eq!(manager.open_handles(), 1);
        assert!(log.lock().unwrap().iter().all(|step| !step.starts_with("release")));

        gate.send(())?;
        let delivered = reader.join().expect("reader thread")?;
        assert!(!delivered, "frame from a stopped source was delivered");
        assert_eq!(manager.open_handles(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["open slow", "release slow"]);
        Ok(())
    }

    #[test]
    fn open_waits_for_retired_reader_release() -> Result<()> {
        let (manager, log, entered, gate) = gated_manager();
        manager.open_file("slow")?;
        let lease = manager.lease(SourceKind::File).expect("file lease");

        let reader = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.read_frame(&lease).map(|frame| frame.is_some()))
        };
        entered.recv()?;
        manager.stop();

        let opener = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.open_file("next"))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(log.lock().unwrap().len(), 1, "opened while old reader was busy");

        gate.send(())?;
        assert!(!reader.join().expect("reader thread")?);
        opener.join().expect("opener thread")?;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["open slow", "release slow", "open next"]
        );
        assert_eq!(manager.open_handles(), 1);
        Ok(())
    }
}
