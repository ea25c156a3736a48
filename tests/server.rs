use std::io::Read;

use anyhow::{anyhow, Context};
use ntest::timeout;
use regex::Regex;

use delta_remote::{consts, protocol::Frame, tty};

mod support;

#[test]
#[timeout(30000)]
fn echo_round_trip() -> anyhow::Result<()> {
    let server = support::server::Proc::new("echo hello").context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    let output = support::read_until_close(&mut stream).context("reading session output")?;
    let output = String::from_utf8_lossy(&output);
    assert!(output.contains("hello"), "unexpected session output: {output:?}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn resize_applies_to_the_pty() -> anyhow::Result<()> {
    // give the resize frame a beat to land before the viewer asks
    // the pty for its size
    let server = support::server::Proc::new("sh -c 'sleep 0.5; stty size'")
        .context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    Frame::Resize(tty::Size { rows: 40, cols: 120 })
        .write_to(&mut stream)
        .context("sending resize")?;

    let output = support::read_until_close(&mut stream).context("reading session output")?;
    let output = String::from_utf8_lossy(&output);
    assert!(output.contains("40 120"), "pty never saw the resize: {output:?}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn repeated_resize_is_ignored() -> anyhow::Result<()> {
    let server = support::server::Proc::new("sleep 2").context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    let size = tty::Size { rows: 40, cols: 120 };
    Frame::Resize(size).write_to(&mut stream).context("sending resize")?;
    Frame::Resize(size).write_to(&mut stream).context("sending duplicate resize")?;

    support::wait_until(|| server.log_contains("resized pty to rows=40 cols=120"))?;
    support::wait_until(|| server.log_contains("ignoring no-op resize"))?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn concurrent_sessions_get_their_own_viewer() -> anyhow::Result<()> {
    let server = support::server::Proc::new("sh -c 'echo pid=$$; sleep 0.3'")
        .context("starting server")?;

    let mut stream_a = server.connect().context("dialing server (a)")?;
    let mut stream_b = server.connect().context("dialing server (b)")?;

    let output_a = String::from_utf8_lossy(&support::read_until_close(&mut stream_a)?)
        .into_owned();
    let output_b = String::from_utf8_lossy(&support::read_until_close(&mut stream_b)?)
        .into_owned();

    let pid_re = Regex::new(r"pid=(\d+)")?;
    let pid_a = &pid_re.captures(&output_a).ok_or(anyhow!("no pid in {output_a:?}"))?[1];
    let pid_b = &pid_re.captures(&output_b).ok_or(anyhow!("no pid in {output_b:?}"))?[1];

    // each client sees exactly one viewer, and not the same one
    assert_eq!(pid_re.find_iter(&output_a).count(), 1);
    assert_eq!(pid_re.find_iter(&output_b).count(), 1);
    assert_ne!(pid_a, pid_b);

    Ok(())
}

#[test]
#[timeout(30000)]
fn close_frame_tears_the_session_down() -> anyhow::Result<()> {
    let server = support::server::Proc::new("sleep 30").context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    Frame::Close.write_to(&mut stream).context("sending close")?;

    // the server should terminate the viewer and close the
    // connection, unblocking this read with an eof
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    support::wait_until(|| server.log_contains("session closed"))?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn killed_viewer_produces_a_close_frame() -> anyhow::Result<()> {
    let server = support::server::Proc::new("sh -c 'echo pid=$$; exec sleep 30'")
        .context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    // scrape the viewer pid out of the session output
    let pid_re = Regex::new(r"pid=(\d+)")?;
    let mut buf = vec![0; consts::BUF_SIZE];
    let mut collected = String::new();
    let pid = loop {
        match Frame::read_into(&mut stream, &mut buf).context("reading session output")? {
            Frame::Data(bytes) => {
                collected.push_str(&String::from_utf8_lossy(bytes));
                if let Some(caps) = pid_re.captures(&collected) {
                    break caps[1].parse::<i32>()?;
                }
            }
            Frame::Close => return Err(anyhow!("session closed before printing its pid")),
            frame => return Err(anyhow!("unexpected frame: {frame:?}")),
        }
    };

    // kill the viewer out from under the server
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
        .context("killing viewer")?;

    // the client side must get a clean close rather than hanging
    support::read_until_close(&mut stream).context("draining to close")?;
    support::wait_until(|| server.log_contains("session closed"))?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn spawn_failure_is_reported_on_the_wire() -> anyhow::Result<()> {
    let server = support::server::Proc::new("delta-remote-test-no-such-binary")
        .context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    let mut buf = vec![0; consts::BUF_SIZE];
    match Frame::read_into(&mut stream, &mut buf).context("reading reply")? {
        Frame::Error(msg) => {
            let msg = String::from_utf8_lossy(msg);
            assert!(msg.contains("could not start session"), "unexpected diagnostic: {msg:?}");
        }
        frame => return Err(anyhow!("expected an error frame, got {frame:?}")),
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn one_bad_session_does_not_poison_the_listener() -> anyhow::Result<()> {
    let server = support::server::Proc::new("echo hello").context("starting server")?;

    // a malformed frame kills this session with a diagnostic
    let mut bad_stream = server.connect().context("dialing server (bad)")?;
    std::io::Write::write_all(&mut bad_stream, &[0xff, 0xff, 0xff])
        .context("writing garbage")?;
    drop(bad_stream);

    // but the server keeps serving fresh connections
    let mut stream = server.connect().context("dialing server (good)")?;
    let output = support::read_until_close(&mut stream).context("reading session output")?;
    assert!(String::from_utf8_lossy(&output).contains("hello"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn viewer_env_is_scrubbed_and_merged() -> anyhow::Result<()> {
    let config = r#"
command = '''sh -c 'echo "mode=[$DELTA_MODE] child=$DELTA_SERVER_CHILD new=$DELTA_NEW kw=$DELTA_KEYWORDS"' '''
grace_period_ms = 1000

[env]
DELTA_KEYWORDS = "/tmp/keywords.md"
"#;
    let server = support::server::Proc::new_full(
        config,
        &[("DELTA_MODE", "server"), ("DELTA_NEW", "/tmp/new-run")],
    )
    .context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    let output = support::read_until_close(&mut stream).context("reading session output")?;
    let output = String::from_utf8_lossy(&output);

    // mode selection vars never reach the viewer
    assert!(output.contains("mode=[]"), "DELTA_MODE leaked: {output:?}");
    // the marker is set, inherited config vars flow through, and the
    // configured env table is merged on top
    assert!(output.contains("child=true"), "missing marker: {output:?}");
    assert!(output.contains("new=/tmp/new-run"), "inherited env lost: {output:?}");
    assert!(output.contains("kw=/tmp/keywords.md"), "config env lost: {output:?}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn sigint_drains_sessions_and_exits_cleanly() -> anyhow::Result<()> {
    let mut server = support::server::Proc::new("sleep 30").context("starting server")?;
    let mut stream = server.connect().context("dialing server")?;

    support::wait_until(|| server.log_contains("spawned viewer"))?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(server.proc.id() as i32),
        nix::sys::signal::Signal::SIGINT,
    )
    .context("interrupting server")?;

    // our connection gets torn down as part of the drain
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    let status = server.proc.wait().context("waiting for server exit")?;
    assert_eq!(status.code(), Some(0), "server did not exit cleanly: {status:?}");

    Ok(())
}
