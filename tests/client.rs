use std::{
    io::Write,
    net::TcpListener,
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context};
use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn pipes_output_without_a_tty() -> anyhow::Result<()> {
    let server = support::server::Proc::new("echo hello").context("starting server")?;

    let client = server
        .client_cmd()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning client")?;
    let out = client.wait_with_output().context("waiting for client")?;

    assert!(out.status.success(), "client exited with {:?}", out.status);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("hello"), "client stdout: {stdout:?}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn forwards_stdin_to_the_session() -> anyhow::Result<()> {
    let server = support::server::Proc::new("head -n1").context("starting server")?;

    let mut client = server
        .client_cmd()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning client")?;

    {
        let mut stdin = client.stdin.take().ok_or(anyhow!("missing stdin"))?;
        stdin.write_all(b"ping\n").context("writing to client stdin")?;
        stdin.flush().context("flushing client stdin")?;
        // dropping stdin closes it, which the non-tty client treats
        // as end of input without ending the session
    }

    let out = client.wait_with_output().context("waiting for client")?;
    assert!(out.status.success(), "client exited with {:?}", out.status);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("ping"), "client stdout: {stdout:?}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn connect_failure_exits_nonzero() -> anyhow::Result<()> {
    // bind then immediately drop a listener to find a port with
    // nothing behind it
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").context("probing for a free port")?;
        listener.local_addr().context("resolving probe addr")?.port()
    };

    let out = Command::new(support::delta_remote_bin())
        .args(["--client", "--port", &port.to_string()])
        .stdin(Stdio::null())
        .output()
        .context("running client")?;

    assert!(!out.status.success(), "client should not exit cleanly");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("connecting to"), "client stderr: {stderr:?}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn spawn_failure_surfaces_to_the_client() -> anyhow::Result<()> {
    let server = support::server::Proc::new("delta-remote-test-no-such-binary")
        .context("starting server")?;

    let out = server
        .client_cmd()
        .stdin(Stdio::null())
        .output()
        .context("running client")?;

    assert!(!out.status.success(), "client should report the spawn failure");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("could not start session"), "client stderr: {stderr:?}");

    Ok(())
}
