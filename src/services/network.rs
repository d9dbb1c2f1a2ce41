use tokio::sync::watch;

/// Read side of the connectivity signal. The ingestion loop checks this
/// synchronously at the start of every cycle; it never blocks.
#[derive(Clone)]
pub struct NetworkMonitor {
    rx: watch::Receiver<bool>,
}

impl NetworkMonitor {
    pub fn is_offline(&self) -> bool {
        *self.rx.borrow()
    }

    /// A monitor that always reports online, for setups without a
    /// connectivity source. The receiver keeps yielding the last sent value
    /// after the handle is gone.
    pub fn always_online() -> Self {
        let (_handle, monitor) = channel(false);
        monitor
    }
}

/// Write side, owned by whatever platform integration supplies
/// connectivity changes.
pub struct NetworkStatusHandle {
    tx: watch::Sender<bool>,
}

impl NetworkStatusHandle {
    pub fn set_offline(&self, offline: bool) {
        self.tx.send_replace(offline);
    }
}

pub fn channel(initially_offline: bool) -> (NetworkStatusHandle, NetworkMonitor) {
    let (tx, rx) = watch::channel(initially_offline);
    (NetworkStatusHandle { tx }, NetworkMonitor { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_online_reports_online() {
        assert!(!NetworkMonitor::always_online().is_offline());
    }

    #[test]
    fn dropped_handle_keeps_the_last_value_readable() {
        let (handle, monitor) = channel(true);
        drop(handle);
        assert!(monitor.is_offline());
    }

    #[test]
    fn reflects_the_latest_signal() {
        let (handle, monitor) = channel(false);
        assert!(!monitor.is_offline());
        handle.set_offline(true);
        assert!(monitor.is_offline());
        handle.set_offline(false);
        assert!(!monitor.is_offline());
    }
}
