pub mod bluefield;
pub mod console;
pub mod ipu;
pub mod list;
pub mod pxeboot;

use color_eyre::eyre::Report;
use dpu_common::{CommandRunner, ShellRunner};
use dpu_hw::HwError;
use dpu_pxe::PxeError;
use std::sync::Arc;

/// Flags shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub dry_run: bool,
}

impl Globals {
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::new(ShellRunner::new().with_dry_run(self.dry_run))
    }
}

/// Process exit status for a failed command: 2 when the device or the
/// arguments are wrong, 3 when a step failed, 4 when PXE retries ran out
pub fn exit_code(report: &Report) -> i32 {
    if let Some(e) = report.downcast_ref::<PxeError>() {
        return e.exit_code();
    }
    if let Some(e) = report.downcast_ref::<HwError>() {
        return if e.is_not_found() { 2 } else { 3 };
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let report = Report::new(HwError::DeviceNotFound("no DPU devices found".into()));
        assert_eq!(exit_code(&report), 2);

        let report = Report::new(HwError::step("flash_spi_image", "flash_erase exited with 1"));
        assert_eq!(exit_code(&report), 3);

        let report = Report::new(PxeError::RetriesExhausted {
            attempts: 6,
            last: Box::new(PxeError::PingTimeout { waited_secs: 180.0 }),
        });
        assert_eq!(exit_code(&report), 4);

        let report = Report::new(std::io::Error::other("boom"));
        assert_eq!(exit_code(&report), 1);
    }
}
