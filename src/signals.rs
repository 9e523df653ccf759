use std::sync::Arc;

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};

use crate::logs_pump::LogsPump;
use crate::runtime::ContainerRuntime;

/// Tells systemd the daemon is up.
pub fn notify_ready() {
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
}

/// What should we do when the user stops this program?
///
/// The first SIGINT or SIGTERM closes every pump and the checkpoint store on
/// `rt_handle`, then exits the process.
pub fn handle_shutdown<R: ContainerRuntime>(
    pumps: Arc<LogsPump<R>>,
    rt_handle: tokio::runtime::Handle,
) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let code = rt_handle.block_on(async move {
                match pumps.shutdown().await {
                    Ok(()) => 0,
                    Err(e) => {
                        log::error!("unclean shutdown: {e}");
                        1
                    }
                }
            });
            std::process::exit(code);
        }
    });

    Ok(())
}
