use crate::error::TrainingResult;
use crate::hypes::Hypes;
use crate::plugin::InputSource;
use tracing::{debug, info};

/// Run the input plugin's download hook, if it has one, against `dirs.data_dir`.
///
/// Returns whether the hook ran.
pub fn maybe_download_and_extract(hypes: &Hypes, input: &dyn InputSource) -> TrainingResult<bool> {
    let Some(download) = input.download() else {
        debug!("Input plugin has no download hook");
        return Ok(false);
    };
    std::fs::create_dir_all(&hypes.dirs.data_dir)?;
    info!("Preparing data in {}", hypes.dirs.data_dir.display());
    download.maybe_download_and_extract(hypes, &hypes.dirs.data_dir)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::{BatchQueue, Coordinator};
    use crate::plugin::{DatasetDownload, Split};
    use crate::test_support::{ConstantInput, load_test_hypes};
    use std::path::Path;
    use tempfile::TempDir;

    struct Marking;

    impl DatasetDownload for Marking {
        fn maybe_download_and_extract(&self, _hypes: &Hypes, data_dir: &Path) -> TrainingResult<()> {
            std::fs::write(data_dir.join("READY"), "")?;
            Ok(())
        }
    }

    struct Downloading(Marking);

    impl InputSource for Downloading {
        fn start_enqueuing_threads(
            &self,
            _hypes: &Hypes,
            _queue: &BatchQueue,
            _split: Split,
            _start_step: u64,
            _coordinator: &mut Coordinator,
        ) -> TrainingResult<()> {
            Ok(())
        }

        fn download(&self) -> Option<&dyn DatasetDownload> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_hook_runs_against_data_dir() {
        let temp = TempDir::new().unwrap();
        let hypes = load_test_hypes(temp.path(), 10);

        assert!(maybe_download_and_extract(&hypes, &Downloading(Marking)).unwrap());
        assert!(hypes.dirs.data_dir.join("READY").exists());
    }

    #[test]
    fn test_without_hook_is_noop() {
        let temp = TempDir::new().unwrap();
        let hypes = load_test_hypes(temp.path(), 10);

        assert!(!maybe_download_and_extract(&hypes, &ConstantInput).unwrap());
        assert!(!hypes.dirs.data_dir.exists());
    }
}
