// Copyright 2024 Delta Vision Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io,
    io::{Read, Write},
    net,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use anyhow::{anyhow, Context};
use signal_hook::{
    consts::{SIGWINCH, TERM_SIGNALS},
    flag,
    iterator::Signals,
};
use tracing::{error, info, instrument, span, warn, Level};

use crate::{
    consts,
    protocol::{is_hangup_error, Frame},
    tty,
};

// ctrl-d, treated as a local disconnect request when read from a raw
// mode terminal
const EOT: u8 = 0x04;

/// How the remote side ended the session.
enum SessionEnd {
    Clean,
    ServerError(String),
}

/// Mirror the local terminal into a remote session: raw mode local
/// terminal, keystrokes out as data frames, remote output verbatim to
/// stdout, local SIGWINCH reported as resize frames. Every exit path
/// restores the terminal flags before returning.
#[instrument(skip_all)]
pub fn run(host: &str, port: u16) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING CLIENT ============================\n\n");

    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("connecting to {host}:{port}"))?;
    stream.set_nodelay(true).context("setting nodelay")?;

    let mut read_stream = stream.try_clone().context("cloning read stream")?;
    let write_stream =
        Arc::new(Mutex::new(stream.try_clone().context("cloning write stream")?));

    // First interrupt starts a graceful teardown, a second one
    // force-exits so a wedged connection can never trap the user.
    let stop = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&stop))
            .context("arming force shutdown flag")?;
        flag::register(*sig, Arc::clone(&stop)).context("registering graceful shutdown flag")?;
    }

    let tty_guard = tty::set_raw_flags()?;
    let is_tty = tty_guard.active();
    if !is_tty {
        info!("not attached to a tty, skipping raw mode and resize reporting");
    }

    if is_tty {
        // report the starting size right away so the viewer lays
        // itself out correctly before the first keystroke
        if let Err(e) = push_resize(&write_stream) {
            warn!("reporting initial window size: {:?}", e);
        }
        spawn_resize_watcher(Arc::clone(&write_stream))?;
    }

    let end = thread::scope(|s| -> anyhow::Result<SessionEnd> {
        // stdin -> conn
        let stdin_to_conn_h = thread::Builder::new()
            .name(String::from("stdin->conn"))
            .spawn_scoped(s, || -> anyhow::Result<()> {
                let _s = span!(Level::INFO, "stdin->conn").entered();
                let mut stdin = io::stdin().lock();
                let mut buf = vec![0; consts::BUF_SIZE];

                loop {
                    if stop.load(Ordering::Relaxed) {
                        info!("recvd stop msg");
                        return Ok(());
                    }

                    let nread = stdin.read(&mut buf).context("reading stdin")?;
                    if nread == 0 {
                        if is_tty {
                            continue;
                        }
                        // Redirected input is drained. Keep the session
                        // alive for output until the server closes it.
                        info!("stdin eof in non-tty mode, parking");
                        loop {
                            if stop.load(Ordering::Relaxed) {
                                return Ok(());
                            }
                            thread::sleep(consts::JOIN_POLL_DURATION);
                        }
                    }

                    let mut chunk = &buf[..nread];
                    let mut disconnect = false;
                    if is_tty {
                        if let Some(i) = chunk.iter().position(|b| *b == EOT) {
                            // ctrl-d is a local disconnect request,
                            // forwarded first so the viewer also sees
                            // end of input
                            chunk = &buf[..i + 1];
                            disconnect = true;
                        }
                    }

                    {
                        let mut conn = write_stream.lock().unwrap();
                        Frame::Data(chunk)
                            .write_to(&mut *conn)
                            .and_then(|_| conn.flush())
                            .context("sending input frame")?;
                        if disconnect {
                            info!("ctrl-d, requesting close");
                            let _ = Frame::Close.write_to(&mut *conn);
                            let _ = conn.flush();
                        }
                    }
                    if disconnect {
                        stop.store(true, Ordering::Relaxed);
                        return Ok(());
                    }
                }
            })
            .map_err(|e| anyhow!("{:?}", e))?;

        // conn -> stdout
        let conn_to_stdout_h = thread::Builder::new()
            .name(String::from("conn->stdout"))
            .spawn_scoped(s, || -> anyhow::Result<SessionEnd> {
                let _s = span!(Level::INFO, "conn->stdout").entered();
                let mut stdout = io::stdout().lock();
                let mut buf = vec![0; consts::BUF_SIZE];

                loop {
                    let frame = match Frame::read_into(&mut read_stream, &mut buf) {
                        Ok(frame) => frame,
                        Err(err) => {
                            if stop.load(Ordering::Relaxed) {
                                return Ok(SessionEnd::Clean);
                            }
                            if is_hangup_error(&err) {
                                return Ok(SessionEnd::ServerError(String::from(
                                    "connection lost",
                                )));
                            }
                            return Err(err.context("reading frame from server"));
                        }
                    };

                    match frame {
                        Frame::Data(bytes) => {
                            stdout.write_all(bytes).context("writing to stdout")?;
                            if let Err(e) = stdout.flush() {
                                if e.kind() == io::ErrorKind::WouldBlock {
                                    // Probably just getting flooded with
                                    // output. Flushing matters for echoed
                                    // keystrokes, not for bulk output.
                                    continue;
                                }
                            }
                        }
                        Frame::Close => {
                            info!("server closed the session");
                            return Ok(SessionEnd::Clean);
                        }
                        Frame::Error(msg) => {
                            return Ok(SessionEnd::ServerError(
                                String::from_utf8_lossy(msg).into_owned(),
                            ));
                        }
                        Frame::Resize(_) => {
                            warn!("ignoring resize frame from server");
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("{:?}", e))?;

        loop {
            if stdin_to_conn_h.is_finished()
                || conn_to_stdout_h.is_finished()
                || stop.load(Ordering::Relaxed)
            {
                stop.store(true, Ordering::Relaxed);
                break;
            }
            thread::sleep(consts::JOIN_POLL_DURATION);
        }

        // Unblock the frame reader if it is still parked on the socket.
        let _ = stream.shutdown(net::Shutdown::Both);

        // The blocking stdin read cannot be cancelled. If it is still
        // stuck after the hangup window there is nothing left to do in
        // this process but shut down, so we restore the terminal and
        // hard-exit rather than complicating the happy path with
        // nonblocking stdin.
        thread::sleep(consts::JOIN_HANGUP_DURATION);
        if !stdin_to_conn_h.is_finished() || !conn_to_stdout_h.is_finished() {
            warn!(
                "exiting due to a stuck io thread stdin_finished={} stdout_finished={}",
                stdin_to_conn_h.is_finished(),
                conn_to_stdout_h.is_finished()
            );
            let code = if conn_to_stdout_h.is_finished() {
                match conn_to_stdout_h.join() {
                    Ok(Ok(SessionEnd::Clean)) => 0,
                    Ok(Ok(SessionEnd::ServerError(msg))) => {
                        drop(tty_guard);
                        eprintln!("\ndelta-remote: {msg}");
                        std::process::exit(1);
                    }
                    _ => 1,
                }
            } else {
                1
            };

            drop(tty_guard);
            eprintln!("\n[delta-remote] disconnected.");
            std::process::exit(code);
        }

        match stdin_to_conn_h.join() {
            Ok(v) => v?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }
        let end = match conn_to_stdout_h.join() {
            Ok(v) => v?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        };

        // restore the terminal before any parting messages
        drop(tty_guard);
        Ok(end)
    })?;

    eprintln!("\n[delta-remote] disconnected.");
    match end {
        SessionEnd::Clean => Ok(()),
        SessionEnd::ServerError(msg) => Err(anyhow!("server error: {msg}")),
    }
}

/// Watch for window size changes and report them to the server as
/// resize frames.
fn spawn_resize_watcher(conn: Arc<Mutex<TcpStream>>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGWINCH]).context("creating signal iterator")?;

    thread::spawn(move || {
        for signal in &mut signals {
            let res = match signal {
                SIGWINCH => push_resize(&conn),
                sig => {
                    error!("unknown signal: {}", sig);
                    panic!("unknown signal: {}", sig);
                }
            };
            if let Err(e) = res {
                error!("resize watcher error: {:?}", e);
            }
        }
    });

    Ok(())
}

fn push_resize(conn: &Mutex<TcpStream>) -> anyhow::Result<()> {
    let size = tty::Size::from_fd(consts::STDIN_FD).context("getting tty size")?;
    info!("pushing resize rows={} cols={}", size.rows, size.cols);

    let mut stream = conn.lock().unwrap();
    Frame::Resize(size).write_to(&mut *stream).context("sending resize frame")?;
    stream.flush().context("flushing resize frame")?;
    Ok(())
}
