use assert_cmd::prelude::*;
use color_eyre::Result;
use std::process::Command;

#[test]
fn test_help_lists_subcommands() -> Result<()> {
    let output = Command::cargo_bin("dpu-tools")?.arg("--help").output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: dpu-tools [OPTIONS] <COMMAND>"), "Missing usage text");
    for command in ["list", "console", "mode", "firmware", "ipu", "pxeboot"] {
        assert!(stdout.contains(command), "Missing {} command", command);
    }
    assert!(stdout.contains("--dry-run"));
    Ok(())
}

#[test]
fn test_firmware_help() -> Result<()> {
    let output = Command::cargo_bin("dpu-tools")?
        .args(["firmware", "--help"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["version", "flash", "reset", "load-bfb", "cx-update"] {
        assert!(stdout.contains(command), "Missing firmware {} command", command);
    }
    Ok(())
}

#[test]
fn test_unknown_reflash_step_is_a_usage_error() -> Result<()> {
    let output = Command::cargo_bin("dpu-tools")?
        .args(["ipu", "reflash", "--imc", "100.0.0.100", "--steps", "clean_up_imc,format_disk"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown step 'format_disk'"));
    Ok(())
}

#[test]
fn test_pxeboot_requires_iso() -> Result<()> {
    let output = Command::cargo_bin("dpu-tools")?.arg("pxeboot").output()?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("<ISO>"));
    Ok(())
}

#[test]
fn test_cx_update_without_mlxup_fails_the_step() -> Result<()> {
    let output = Command::cargo_bin("dpu-tools")?
        .args(["firmware", "cx-update", "--mlxup", "/nonexistent/mlxup"])
        .output()?;
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("/nonexistent/mlxup does not exist"));
    Ok(())
}
