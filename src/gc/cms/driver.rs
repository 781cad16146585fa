use std::sync::Arc;
use std::thread::JoinHandle;

use crate::gc::cms::CmsCollector;

/// Spawns the background driver. It sleeps between cycles (responsive to
/// explicit requests), runs one cycle at a time, and exits on `stop`.
pub fn start(collector: Arc<CmsCollector>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("gc-driver".into())
        .spawn(move || driver_loop(&collector))
        .expect("failed to spawn gc driver")
}

fn driver_loop(collector: &Arc<CmsCollector>) {
    while let Some(reason) = collector.wait_for_trigger() {
        if collector.flags.gc_verbose {
            println!("GC: concurrent cycle start ({})", reason);
        }

        collector.run_background_cycle(reason);
    }
}
