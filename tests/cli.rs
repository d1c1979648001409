use std::process::Command;

fn jsvmp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_jsvmp"))
}

// --- Inline code: run ---

#[test]
fn inline_run_prints_to_stdout() {
    let out = jsvmp()
        .args(["print(1 + 2 * 3);"])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "7\n");
}

#[test]
fn inline_closure_scenario() {
    let out = jsvmp()
        .args(["function mk(s){let c=s; function step(){c=c+1; return c;} return step;} let a=mk(0); print(a()); print(a());"])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "1\n2\n");
}

#[test]
fn inline_protect_matches_plain_output() {
    let source = "function fact(n){if (n==0){return 1;} else {return n*fact(n-1);}} print(fact(5));";
    let plain = jsvmp().args([source]).output().expect("failed to run jsvmp");
    let protected = jsvmp()
        .args([source, "--protect"])
        .output()
        .expect("failed to run jsvmp");
    assert!(plain.status.success());
    assert!(protected.status.success(), "stderr: {}", String::from_utf8_lossy(&protected.stderr));
    assert_eq!(plain.stdout, protected.stdout);
    assert_eq!(String::from_utf8_lossy(&plain.stdout), "120\n");
}

// --- Emitting and re-running images ---

#[test]
fn emit_image_then_run_image() {
    let out = jsvmp()
        .args(["print(40 + 2);", "--emit", "image"])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success());
    let image = String::from_utf8_lossy(&out.stdout).trim().to_string();
    assert!(image.chars().all(|c| c.is_ascii_hexdigit()));

    let rerun = jsvmp()
        .args(["--run-image", &image])
        .output()
        .expect("failed to run jsvmp");
    assert!(rerun.status.success(), "stderr: {}", String::from_utf8_lossy(&rerun.stderr));
    assert_eq!(String::from_utf8_lossy(&rerun.stdout), "42\n");
}

#[test]
fn emit_vmp_then_run_vmp() {
    let out = jsvmp()
        .args([r#"print("Hello" + " " + "JSVMP" + "!");"#, "--emit", "vmp"])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success());
    let image = String::from_utf8_lossy(&out.stdout).trim().to_string();
    assert!(image.starts_with("564d03"));

    let rerun = jsvmp()
        .args(["--run-vmp", &image])
        .output()
        .expect("failed to run jsvmp");
    assert!(rerun.status.success(), "stderr: {}", String::from_utf8_lossy(&rerun.stderr));
    assert_eq!(String::from_utf8_lossy(&rerun.stdout), "Hello JSVMP!\n");
}

#[test]
fn emit_asm_lists_bytecode() {
    let out = jsvmp()
        .args(["let a = 1; print(a);", "--emit", "asm"])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("push_const"), "expected listing, got: {stdout}");
    assert!(stdout.contains("halt"), "expected halt, got: {stdout}");
}

#[test]
fn dump_outputs_program_json() {
    let out = jsvmp()
        .args(["let a = 1;", "--dump"])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success());
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("dump should be valid JSON");
    assert!(v["code"].is_array());
    assert!(v["consts"].is_array());
}

// --- Error cases ---

#[test]
fn no_args_shows_usage() {
    let out = jsvmp().output().expect("failed to run jsvmp");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Usage"), "expected usage message, got: {stderr}");
}

#[test]
fn parse_error_is_reported_on_stderr() {
    let out = jsvmp()
        .args(["-t", "let a 1;"])
        .output()
        .expect("failed to run jsvmp");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Expect =, got num"), "got: {stderr}");
}

#[test]
fn lex_error_is_reported_on_stderr() {
    let out = jsvmp()
        .args(["-t", "let a = @;"])
        .output()
        .expect("failed to run jsvmp");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Unexpected char @"), "got: {stderr}");
}

#[test]
fn runtime_error_is_reported_on_stderr() {
    let out = jsvmp()
        .args(["-t", "print(missing);"])
        .output()
        .expect("failed to run jsvmp");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Undefined variable: missing"), "got: {stderr}");
}

#[test]
fn json_mode_emits_parseable_diagnostics() {
    let out = jsvmp()
        .args(["--json", "let a 1;"])
        .output()
        .expect("failed to run jsvmp");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    let line = stderr.lines().next().expect("expected a diagnostic line");
    let v: serde_json::Value = serde_json::from_str(line).expect("diagnostic should be JSON");
    assert_eq!(v["severity"], "error");
    assert_eq!(v["message"], "Expect =, got num");
}

#[test]
fn tampered_vmp_image_fails_integrity() {
    let out = jsvmp()
        .args(["print(9);", "--emit", "vmp"])
        .output()
        .expect("failed to run jsvmp");
    let image = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let tag = &image[image.len() - 4..];
    let replacement = if tag == "0000" { "ffff" } else { "0000" };
    let tampered = format!("{}{replacement}", &image[..image.len() - 4]);

    let rerun = jsvmp()
        .args(["-t", "--run-vmp", &tampered])
        .output()
        .expect("failed to run jsvmp");
    assert!(!rerun.status.success());
    let stderr = String::from_utf8_lossy(&rerun.stderr);
    assert!(
        stderr.contains("Integrity check failed - code may be tampered"),
        "got: {stderr}"
    );
}

#[test]
fn version_flag() {
    let out = jsvmp().args(["--version"]).output().expect("failed to run jsvmp");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("jsvmp "));
}

#[test]
fn help_shows_modes() {
    let out = jsvmp().args(["help"]).output().expect("failed to run jsvmp");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("--protect"));
    assert!(stdout.contains("--run-vmp"));
}

// --- File mode ---

#[test]
fn file_source_runs() {
    let dir = std::env::temp_dir();
    let path = dir.join("jsvmp_cli_test_prog.js");
    std::fs::write(&path, "let x = 5; print(x * x);").expect("write temp file");
    let out = jsvmp()
        .args([path.to_str().expect("utf-8 temp path")])
        .output()
        .expect("failed to run jsvmp");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "25\n");
    let _ = std::fs::remove_file(&path);
}
