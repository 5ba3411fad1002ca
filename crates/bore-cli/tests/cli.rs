use assert_cmd::Command;

#[test]
fn help_lists_tunnel_flags() {
    let output = Command::cargo_bin("bore").unwrap().arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for flag in ["--server", "--local-port", "--bind-port", "--id", "--reconnect", "--ca-cert"] {
        assert!(help.contains(flag), "missing {flag} in help");
    }
}

#[test]
fn invalid_port_is_rejected() {
    Command::cargo_bin("bore")
        .unwrap()
        .args(["--local-port", "70000"])
        .assert()
        .failure();
}
