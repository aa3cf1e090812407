//! OS keyboard hook - device discovery, event forwarding and the
//! process-wide single-hook guard

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use evdev::{Device, InputEventKind, Key};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::{HotkeyError, KeyEvent};

static HOOK_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Proof that this process holds the one global hook. Released on drop.
#[derive(Debug)]
pub struct HookRegistration(());

impl HookRegistration {
    pub fn acquire() -> Result<Self, HotkeyError> {
        HOOK_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| HookRegistration(()))
            .map_err(|_| HotkeyError::AlreadyActive)
    }

    pub fn is_held() -> bool {
        HOOK_ACTIVE.load(Ordering::SeqCst)
    }
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        HOOK_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Where key events come from.
pub trait KeySource: Send + Sync + 'static {
    /// Start forwarding key events until `cancel` fires. Returns the number
    /// of devices being watched. Must be called inside a tokio runtime.
    fn listen(
        &self,
        events: UnboundedSender<KeyEvent>,
        cancel: CancellationToken,
    ) -> Result<usize, HotkeyError>;

    fn name(&self) -> &'static str;
}

/// An installed hook. Dropping it stops delivery and frees the registration.
#[derive(Debug)]
pub struct HookHandle {
    cancel: CancellationToken,
    device_count: usize,
    _registration: HookRegistration,
}

impl HookHandle {
    pub fn device_count(&self) -> usize {
        self.device_count
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        log::info!("Releasing hotkey hook");
        self.cancel.cancel();
    }
}

/// Register the process-wide hook on `source`. Fails fast with
/// [`HotkeyError::AlreadyActive`] or the source's permission error.
pub fn install_hook(
    source: &dyn KeySource,
    events: UnboundedSender<KeyEvent>,
) -> Result<HookHandle, HotkeyError> {
    let registration = HookRegistration::acquire()?;
    let cancel = CancellationToken::new();
    let device_count = source.listen(events, cancel.clone())?;
    log::info!(
        "Hotkey hook installed via {} on {} device(s)",
        source.name(),
        device_count
    );
    Ok(HookHandle {
        cancel,
        device_count,
        _registration: registration,
    })
}

/// Find all keyboard devices on the system
pub fn find_keyboards() -> Vec<(PathBuf, Device)> {
    evdev::enumerate()
        .filter_map(|(path, device)| {
            // A keyboard should support common keys
            let is_keyboard = device.supported_keys().map_or(false, |keys| {
                keys.contains(Key::KEY_ENTER)
                    && keys.contains(Key::KEY_SPACE)
                    && keys.contains(Key::KEY_A)
                    && keys.contains(Key::KEY_Z)
            });

            if is_keyboard {
                let name = device.name().unwrap_or("Unknown");
                log::info!("Found keyboard device: {:?} ({})", path, name);
                Some((path, device))
            } else {
                None
            }
        })
        .collect()
}

/// Check if we have permission to access input devices
pub fn check_permissions(keyboards: &[(PathBuf, Device)]) -> Result<(), HotkeyError> {
    if !keyboards.is_empty() {
        return Ok(());
    }

    let all_devices = evdev::enumerate().count();
    if all_devices == 0 {
        Err(HotkeyError::PermissionDenied(
            "No input devices readable. Ensure you are in the 'input' group:\n\
             sudo usermod -aG input $USER\n\
             Then log out and back in."
                .to_string(),
        ))
    } else {
        Err(HotkeyError::PermissionDenied(format!(
            "Found {} input devices but none appear to be keyboards. \
             This might be a permissions issue or no keyboard is connected.",
            all_devices
        )))
    }
}

/// Reads every keyboard under /dev/input.
#[derive(Debug, Default, Clone)]
pub struct EvdevKeySource;

impl KeySource for EvdevKeySource {
    fn listen(
        &self,
        events: UnboundedSender<KeyEvent>,
        cancel: CancellationToken,
    ) -> Result<usize, HotkeyError> {
        let keyboards = find_keyboards();
        check_permissions(&keyboards)?;

        let device_count = keyboards.len();
        for (path, device) in keyboards {
            let tx = events.clone();
            let cancel = cancel.clone();
            let path_str = path.to_string_lossy().to_string();
            tokio::spawn(async move {
                monitor_device(path_str, device, tx, cancel).await;
            });
        }
        Ok(device_count)
    }

    fn name(&self) -> &'static str {
        "evdev"
    }
}

/// Forward key events from one keyboard device
async fn monitor_device(
    path: String,
    device: Device,
    tx: UnboundedSender<KeyEvent>,
    cancel: CancellationToken,
) {
    let name = device.name().unwrap_or("Unknown").to_string();
    log::info!("Monitoring keyboard device: {} ({})", path, name);

    let mut stream = match device.into_event_stream() {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to create event stream for {}: {}", path, e);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("Hotkey monitoring cancelled for {}", path);
                break;
            }

            result = stream.next_event() => {
                match result {
                    Ok(ev) => {
                        if let InputEventKind::Key(key) = ev.kind() {
                            if tx.send(KeyEvent { key, value: ev.value() }).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Device read error for {} (disconnected?): {}", path, e);
                        break;
                    }
                }
            }
        }
    }

    log::info!("Stopped monitoring device: {}", path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests here share the process-wide hook flag
    static HOOK_LOCK: Mutex<()> = Mutex::new(());

    struct NoDevices;

    impl KeySource for NoDevices {
        fn listen(
            &self,
            _events: UnboundedSender<KeyEvent>,
            _cancel: CancellationToken,
        ) -> Result<usize, HotkeyError> {
            Err(HotkeyError::PermissionDenied("no keyboards".into()))
        }
        fn name(&self) -> &'static str {
            "none"
        }
    }

    struct Silent;

    impl KeySource for Silent {
        fn listen(
            &self,
            _events: UnboundedSender<KeyEvent>,
            _cancel: CancellationToken,
        ) -> Result<usize, HotkeyError> {
            Ok(1)
        }
        fn name(&self) -> &'static str {
            "silent"
        }
    }

    #[test]
    fn only_one_hook_at_a_time() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let first = install_hook(&Silent, tx.clone()).unwrap();
        assert_eq!(
            install_hook(&Silent, tx.clone()).err(),
            Some(HotkeyError::AlreadyActive)
        );

        drop(first);
        let again = install_hook(&Silent, tx).unwrap();
        assert_eq!(again.device_count(), 1);
    }

    #[test]
    fn permission_failure_releases_registration() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let err = install_hook(&NoDevices, tx.clone()).err().unwrap();
        assert!(matches!(err, HotkeyError::PermissionDenied(_)));
        assert!(!HookRegistration::is_held());

        assert!(install_hook(&Silent, tx).is_ok());
    }

    #[test]
    fn dropping_handle_cancels_listener() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = install_hook(&Silent, tx).unwrap();
        let token = handle.cancel.clone();
        assert!(!token.is_cancelled());
        drop(handle);
        assert!(token.is_cancelled());
        assert!(!HookRegistration::is_held());
    }
}
