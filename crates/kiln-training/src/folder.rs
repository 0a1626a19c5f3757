use crate::error::TrainingResult;
use crate::hypes::Hypes;
use crate::layout::TrainingLayout;
use crate::logging::LogSink;
use crate::plugin::PluginRole;
use tracing::{debug, info, warn};

/// Prepare the output directory of a run.
///
/// Creates `output_dir/model_files`, snapshots the resolved hypes and the plugin files
/// under their canonical names and attaches `output.log` to `sink`. Safe to repeat; a
/// previous snapshot is overwritten. A log file that cannot be opened only costs the
/// file log.
pub fn initialize_training_folder(hypes: &Hypes, sink: &LogSink) -> TrainingResult<TrainingLayout> {
    let layout = TrainingLayout::new(hypes.dirs.output_dir.clone());
    layout.ensure_dirs()?;

    if let Err(e) = sink.attach(&layout.output_log_path()) {
        warn!("Could not open {}: {e}", layout.output_log_path().display());
    }

    std::fs::write(layout.hypes_snapshot_path(), serde_json::to_string_pretty(hypes)?)?;

    for role in PluginRole::ALL {
        let Some(source) = hypes.plugin_path(role) else {
            continue;
        };
        let target = layout.plugin_snapshot_path(role);
        if source == target {
            continue;
        }
        std::fs::copy(&source, &target)?;
        debug!(role = %role, from = %source.display(), "Snapshotted plugin file");
    }

    info!("Training folder: {}", layout.root().display());
    Ok(layout)
}
