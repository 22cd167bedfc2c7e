//! Integration tests running the real crushtool binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const SAMPLE: &str = "\
# a small sample map
device 0 osd0
device 1 osd1
device 2 osd2
type 1 host
host h1 {
\tid -1
\talg straw
\titem osd0 weight 1.000
\titem osd1 weight 1.000
\titem osd2 weight 2.000
}
rule data {
\tpool 0
\ttype replicated
\tmin_size 1
\tmax_size 10
\tstep take h1
\tstep choose firstn 0 type device
\tstep emit
}
";

fn crushtool(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crushtool"))
        .args(args)
        .output()
        .expect("failed to run crushtool")
}

fn write_sample(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("map.txt");
    std::fs::write(&path, SAMPLE).expect("failed to write sample");
    path
}

fn s(path: &Path) -> &str {
    path.to_str().expect("non-utf8 temp path")
}

#[test]
fn test_compile_validate_only() {
    let dir = TempDir::new().unwrap();
    let txt = write_sample(&dir);
    let out = crushtool(&["-c", s(&txt)]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("successfully compiled"), "{stdout}");
    // Validation only: nothing new in the directory.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_compile_then_decompile_round_trip() {
    let dir = TempDir::new().unwrap();
    let txt = write_sample(&dir);
    let bin = dir.path().join("map");
    let out = crushtool(&["-c", s(&txt), "-o", s(&bin)]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(bin.exists());

    // Decompile to stdout.
    let out = crushtool(&["-d", s(&bin)]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout).into_owned();
    assert!(text.contains("# begin crush map"), "{text}");
    assert!(text.contains("host h1 {"), "{text}");

    // Recompile the decompiled text; binaries must match.
    let txt2 = dir.path().join("map2.txt");
    std::fs::write(&txt2, &text).unwrap();
    let bin2 = dir.path().join("map2");
    let out = crushtool(&["-c", s(&txt2), "-o", s(&bin2)]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(std::fs::read(&bin).unwrap(), std::fs::read(&bin2).unwrap());
}

#[test]
fn test_decompile_to_file() {
    let dir = TempDir::new().unwrap();
    let txt = write_sample(&dir);
    let bin = dir.path().join("map");
    assert!(crushtool(&["-c", s(&txt), "-o", s(&bin)]).status.success());

    let outtxt = dir.path().join("out.txt");
    let out = crushtool(&["-d", s(&bin), "-o", s(&outtxt)]);
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
    let text = std::fs::read_to_string(&outtxt).unwrap();
    assert!(text.contains("# end crush map"));
}

#[test]
fn test_refuses_to_clobber() {
    let dir = TempDir::new().unwrap();
    let txt = write_sample(&dir);
    let bin = dir.path().join("map");
    std::fs::write(&bin, b"precious").unwrap();

    let out = crushtool(&["-c", s(&txt), "-o", s(&bin)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("--clobber"));
    assert_eq!(std::fs::read(&bin).unwrap(), b"precious");

    let out = crushtool(&["-c", s(&txt), "-o", s(&bin), "--clobber"]);
    assert!(out.status.success());
    assert_ne!(std::fs::read(&bin).unwrap(), b"precious");
}

#[test]
fn test_compile_error_is_line_qualified() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.txt");
    std::fs::write(&path, "device 0 osd0\ndevice 1 osd0\n").unwrap();
    let out = crushtool(&["-c", s(&path)]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    let expected = format!("{}:2: 'osd0' is already defined", path.display());
    assert!(stderr.contains(&expected), "stderr: {stderr}");
}

#[test]
fn test_garbage_binary_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("junk");
    std::fs::write(&path, b"this is not a crush map").unwrap();
    let out = crushtool(&["-d", s(&path)]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("magic"), "stderr: {stderr}");
}

#[test]
fn test_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    let out = crushtool(&["-c", s(&dir.path().join("absent.txt"))]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!out.stderr.is_empty());
}

#[test]
fn test_modes_are_mutually_exclusive() {
    let dir = TempDir::new().unwrap();
    let txt = write_sample(&dir);
    let out = crushtool(&["-c", s(&txt), "-d", s(&txt)]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_no_mode_fails() {
    let out = crushtool(&[]);
    assert_eq!(out.status.code(), Some(1));
}
