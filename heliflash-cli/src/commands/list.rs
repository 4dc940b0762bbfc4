//! `list`: a short Listener-only run that reports every target currently
//! observed on the bus.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use console::style;
use heliflash::{Listener, Result, SerialFrameTransport};

/// How long to watch the bus before reporting what was seen. Long enough
/// to catch both the fast and slow halves of a ping cycle.
const LISTEN_WINDOW: Duration = Duration::from_millis(2500);

pub(crate) fn run(transport: &Arc<Mutex<SerialFrameTransport>>, listener: &Listener, quiet: bool) -> Result<()> {
    if !quiet {
        eprintln!("{} listening for {:?}...", style("...").dim(), LISTEN_WINDOW);
    }

    let deadline = Instant::now() + LISTEN_WINDOW;
    while Instant::now() < deadline {
        if heliflash::is_interrupted_requested() {
            break;
        }
        let event = transport.lock().unwrap().recv(Duration::from_millis(100))?;
        if let Some(adapter_event) = event {
            let _ = listener.observe_event(&adapter_event);
        }
    }

    print_report(listener);
    Ok(())
}

fn print_report(listener: &Listener) {
    let bootloaders = listener.active_bootloaders();
    let applications = listener.aware_applications();
    let bootloader_builds = listener.bootloader_builds();
    let application_builds = listener.application_builds();

    if bootloaders.is_empty() && applications.is_empty() {
        println!("no targets observed");
        return;
    }

    for target in heliflash::Target::ALL {
        let mut lines = Vec::new();
        if let Some(bl) = bootloaders.get(&target) {
            lines.push(format!(
                "bootloader: {:?} ({} KiB flash, entry {:?})",
                bl.state, bl.flash_size_kib, bl.entry_reason
            ));
            if let Some(build) = bootloader_builds.get(&target) {
                lines.push(format!(
                    "  build: {:#010x}{}",
                    build.commit_sha,
                    if build.dirty_repo { " (dirty)" } else { "" }
                ));
            }
        }
        if let Some(app) = applications.get(&target) {
            lines.push(format!("application: bl_pending={}", app.bl_pending));
            if let Some(build) = application_builds.get(&target) {
                lines.push(format!(
                    "  build: {:#010x}{}",
                    build.commit_sha,
                    if build.dirty_repo { " (dirty)" } else { "" }
                ));
            }
        }
        if !lines.is_empty() {
            println!("{}", style(target.name()).bold());
            for line in lines {
                println!("  {line}");
            }
        }
    }
}
