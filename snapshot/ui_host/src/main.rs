use serde_json::Value;
use snapshot_ui_host_runtime::worklet_ref::{UnmountHandle, WorkletRunner};
use snapshot_ui_host_runtime::{
    ElementHandle, HostConfig, MainThreadContext, MainTree, MemoryBackend,
};
use std::process;

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        eprintln!("ui_host fatal error: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig::from_env();
    let definitions = config.load_definitions()?;
    log::debug!("outbound queue capacity {}", config.outbound_queue_cap);

    let tree = MainTree::new(MemoryBackend::new(), LoggingWorkletRunner::default())
        .with_definitions(definitions);
    let mut context = MainThreadContext::new(tree);

    snapshot_ui_host_runtime::run(&mut context, &config)?;

    if log::log_enabled!(log::Level::Debug) {
        let backend = context.tree().backend();
        for root in context.tree().root_elements() {
            log::debug!("final tree:\n{}", backend.dump_tree(Some(&root)));
        }
    }
    Ok(())
}

/// The headless host has no script engine; worklets are only logged.
#[derive(Debug, Default)]
struct LoggingWorkletRunner {
    next_handle: u64,
}

impl WorkletRunner<ElementHandle> for LoggingWorkletRunner {
    fn run(&mut self, worklet: &Value, element: Option<&ElementHandle>) -> Option<UnmountHandle> {
        let id = worklet.get("_wkltId").cloned().unwrap_or(Value::Null);
        match element {
            Some(element) => {
                self.next_handle += 1;
                log::info!("worklet {id} attached to element {}", element.0);
                Some(UnmountHandle(self.next_handle))
            }
            None => {
                log::info!("worklet {id} run without element");
                None
            }
        }
    }

    fn unmount(&mut self, handle: UnmountHandle) {
        log::info!("worklet unmount {}", handle.0);
    }
}
