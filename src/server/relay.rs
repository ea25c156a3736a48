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
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::{anyhow, Context};
use nix::poll;
use tracing::{debug, error, info, instrument, span, warn, Level};

use crate::{
    config, consts,
    protocol::{is_hangup_error, Frame},
    server::{
        registry::{Registry, SessionHandle, SessionState, StateCell},
        session::{PtySession, ResizeOutcome},
    },
    tty,
};

const INITIAL_WINDOW_SIZE: tty::Size = tty::Size { rows: 24, cols: 80 };

/// Server accepts connections and runs one relay per client.
pub struct Server {
    config: config::Config,
    command: Vec<String>,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(config: config::Config) -> anyhow::Result<Arc<Self>> {
        let command = config.command_line()?;
        Ok(Arc::new(Server { config, command, registry: Arc::new(Registry::new()) }))
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut conn_counter = 0;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream, conn_id) {
                            error!("handling session {}: {:?}", conn_id, err);
                        }
                    });
                }
                Err(err) => {
                    error!("accepting stream: {:?}", err);
                }
            }
        }

        Ok(())
    }

    /// One instance of this runs per accepted connection: spawn the
    /// viewer in a pty, register the session, pump bytes both ways,
    /// then tear everything down no matter which side ended first.
    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, stream: TcpStream, conn_id: u64) -> anyhow::Result<()> {
        let peer = stream.peer_addr().context("getting peer address")?;
        info!("client connected: {}", peer);
        stream.set_nodelay(true).context("setting nodelay")?;

        let session = match PtySession::spawn(
            conn_id,
            &self.command,
            self.config.env.as_ref(),
            INITIAL_WINDOW_SIZE,
            self.config.grace_period(),
        ) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                // Never silently drop the client: report the spawn
                // failure on the wire before disconnecting.
                error!("spawning viewer: {:?}", err);
                let msg = format!("could not start session: {:#}", err);
                let mut writer = &stream;
                if let Err(write_err) = Frame::Error(msg.as_bytes())
                    .write_to(&mut writer)
                    .and_then(|_| Frame::Close.write_to(&mut writer))
                {
                    warn!("reporting spawn failure to client: {}", write_err);
                }
                let _ = stream.shutdown(net::Shutdown::Both);
                return Err(err);
            }
        };

        let handle = Arc::new(SessionHandle {
            id: conn_id,
            peer,
            pty: Arc::clone(&session),
            stream: stream.try_clone().context("cloning stream for registry")?,
            state: StateCell::new(),
        });
        self.registry.insert(Arc::clone(&handle));
        handle.state.advance(SessionState::Active);

        let relay_res = relay(&handle, &stream);

        // Final teardown. The relay already terminated the viewer and
        // shut the stream down, both of which are idempotent, so this
        // is just belt and braces for error paths.
        session.terminate();
        let _ = stream.shutdown(net::Shutdown::Both);
        handle.state.advance(SessionState::Closed);
        self.registry.remove(conn_id);

        match session.exit_notifier.wait(Some(time::Duration::ZERO)) {
            Some(code) => info!("session closed for {}, viewer exit code {}", peer, code),
            None => info!("session closed for {}", peer),
        }

        relay_res
    }
}

/// Pump bytes between the connection and the pty until either side
/// ends. The first pump to finish triggers cancellation of the other:
/// the stop flag covers the poll loop, shutting the socket down
/// unblocks the frame reader, and terminating the viewer unblocks any
/// pty I/O in progress. A half-dead relay must not linger.
#[instrument(skip_all, fields(cid = handle.id))]
fn relay(handle: &SessionHandle, stream: &TcpStream) -> anyhow::Result<()> {
    let mut conn_reader = stream.try_clone().context("cloning conn read stream")?;
    let mut conn_writer = stream.try_clone().context("cloning conn write stream")?;
    let master = handle.pty.master()?;
    let stop = AtomicBool::new(false);
    let conn_id = handle.id;

    thread::scope(|s| -> anyhow::Result<()> {
        let conn_to_pty_h = thread::Builder::new()
            .name(format!("conn->pty({conn_id})"))
            .spawn_scoped(s, || -> anyhow::Result<()> {
                let _s = span!(Level::INFO, "conn->pty", cid = conn_id).entered();
                let mut master_writer = master;
                let mut buf: Vec<u8> = vec![0; consts::BUF_SIZE];

                loop {
                    if stop.load(Ordering::Relaxed) {
                        info!("recvd stop msg");
                        return Ok(());
                    }

                    let frame = match Frame::read_into(&mut conn_reader, &mut buf) {
                        Ok(frame) => frame,
                        Err(err) => {
                            if stop.load(Ordering::Relaxed) || is_hangup_error(&err) {
                                info!("connection hangup");
                                return Ok(());
                            }
                            // anything else is a protocol error, fatal
                            // to this one session only
                            return Err(err.context("reading frame from client"));
                        }
                    };

                    match frame {
                        Frame::Data(bytes) => {
                            let res = master_writer
                                .write_all(bytes)
                                .and_then(|_| master_writer.flush());
                            if let Err(e) = res {
                                if e.raw_os_error() == Some(libc::EIO) {
                                    info!("pty closed while writing, viewer exited");
                                    return Ok(());
                                }
                                return Err(e).context("writing client data to pty");
                            }
                        }
                        Frame::Resize(size) => match handle.pty.resize(size)? {
                            ResizeOutcome::Applied => {
                                info!("resized pty to rows={} cols={}", size.rows, size.cols)
                            }
                            ResizeOutcome::Ignored => debug!("ignoring no-op resize"),
                        },
                        Frame::Close => {
                            info!("client requested close");
                            return Ok(());
                        }
                        Frame::Error(msg) => {
                            return Err(anyhow!(
                                "unexpected error frame from client: {}",
                                String::from_utf8_lossy(msg)
                            ));
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("{:?}", e))?;

        let pty_to_conn_h = thread::Builder::new()
            .name(format!("pty->conn({conn_id})"))
            .spawn_scoped(s, || -> anyhow::Result<()> {
                let _s = span!(Level::INFO, "pty->conn", cid = conn_id).entered();
                let mut master_reader = master;
                let fd_source = master;
                let mut buf: Vec<u8> = vec![0; consts::BUF_SIZE];
                let mut poll_fds = [poll::PollFd::new(
                    fd_source.borrow_fd().ok_or(anyhow!("no master fd"))?,
                    poll::PollFlags::POLLIN,
                )];

                loop {
                    if stop.load(Ordering::Relaxed) {
                        info!("recvd stop msg");
                        return Ok(());
                    }

                    // Park in poll with a timeout so the stop flag
                    // still gets honored while the viewer is quiet.
                    let nready =
                        poll::poll(&mut poll_fds, consts::PTY_POLL_MS).context("polling pty")?;
                    if nready == 0 {
                        continue;
                    }

                    let len = match master_reader.read(&mut buf) {
                        Ok(len) => len,
                        // EIO from a pty master means the viewer is
                        // gone and the buffered output is drained
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => 0,
                        Err(e) => return Err(e).context("reading viewer output"),
                    };
                    if len == 0 {
                        info!("viewer output eof, sending close");
                        let res = Frame::Close
                            .write_to(&mut conn_writer)
                            .and_then(|_| conn_writer.flush());
                        if let Err(e) = res {
                            if e.kind() != io::ErrorKind::BrokenPipe {
                                warn!("writing close frame: {}", e);
                            }
                        }
                        return Ok(());
                    }

                    let res = Frame::Data(&buf[..len])
                        .write_to(&mut conn_writer)
                        .and_then(|_| conn_writer.flush());
                    match res {
                        Ok(_) => {}
                        Err(e)
                            if e.kind() == io::ErrorKind::BrokenPipe
                                || e.kind() == io::ErrorKind::ConnectionReset =>
                        {
                            info!("client hangup: {}", e);
                            return Ok(());
                        }
                        Err(e) => return Err(e).context("writing data frame to client"),
                    }
                }
            })
            .map_err(|e| anyhow!("{:?}", e))?;

        loop {
            if conn_to_pty_h.is_finished() || pty_to_conn_h.is_finished() {
                debug!(
                    "signaling for pumps to stop: conn_to_pty_finished={} pty_to_conn_finished={}",
                    conn_to_pty_h.is_finished(),
                    pty_to_conn_h.is_finished(),
                );
                stop.store(true, Ordering::Relaxed);
                break;
            }
            thread::sleep(consts::JOIN_POLL_DURATION);
        }

        handle.state.advance(SessionState::Closing);

        // Unblock the frame reader if it is still parked on the socket.
        if let Err(e) = stream.shutdown(net::Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!("shutting down conn stream: {}", e);
            }
        }

        // Unblock any pty read or write in progress. If the viewer
        // already exited this is a no-op.
        handle.pty.terminate();

        debug!("joining conn_to_pty_h");
        match conn_to_pty_h.join() {
            Ok(v) => v?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }
        debug!("joining pty_to_conn_h");
        match pty_to_conn_h.join() {
            Ok(v) => v?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }
        debug!("joined both pumps");

        Ok(())
    })
}
