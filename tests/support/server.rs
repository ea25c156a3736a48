use std::{
    fs,
    io::{BufRead, BufReader},
    net::TcpStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use tempfile::TempDir;

use super::delta_remote_bin;

/// Proc is a helper handle for a `delta-remote --server` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub port: u16,
    pub log_file: PathBuf,
    tmp_dir: TempDir,
}

impl Proc {
    /// Start a server on an ephemeral port running the given session
    /// command, with a short grace period so teardown tests stay fast.
    pub fn new(command: &str) -> anyhow::Result<Proc> {
        Self::new_full(
            &format!("command = '''{command}'''\ngrace_period_ms = 1000\n"),
            &[],
        )
    }

    pub fn new_full(config: &str, extra_env: &[(&str, &str)]) -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("delta-remote-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;

        let config_file = tmp_dir.path().join("config.toml");
        fs::write(&config_file, config).context("writing config file")?;

        let log_file = tmp_dir.path().join("server.log");
        eprintln!("spawning server proc with log {:?}", &log_file);

        let mut cmd = Command::new(delta_remote_bin());
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::null())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--config-file")
            .arg(&config_file)
            .arg("--server")
            .arg("--port")
            .arg("0");
        for (var, val) in extra_env {
            cmd.env(var, val);
        }
        let mut proc = cmd.spawn().context("spawning server process")?;

        // The server announces its bound address on stdout, which is
        // how we discover the ephemeral port.
        let stdout = proc.stdout.take().ok_or(anyhow!("missing stdout"))?;
        let banner = BufReader::new(stdout)
            .lines()
            .next()
            .ok_or(anyhow!("server exited without a listening banner"))?
            .context("reading listening banner")?;
        let port = banner
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or(anyhow!("could not parse port from '{banner}'"))?;

        Ok(Proc { proc, port, log_file, tmp_dir })
    }

    /// Dial the server, retrying briefly in case the listener is
    /// still coming up.
    pub fn connect(&self) -> anyhow::Result<TcpStream> {
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", self.port)) {
                stream.set_nodelay(true).context("setting nodelay")?;
                return Ok(stream);
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Err(anyhow!("could not dial server on port {}", self.port))
    }

    /// A Command ready to run `delta-remote --client` against this
    /// server.
    pub fn client_cmd(&self) -> Command {
        let mut cmd = Command::new(delta_remote_bin());
        cmd.arg("--client").arg("--port").arg(self.port.to_string());
        cmd
    }

    pub fn log_contains(&self, needle: &str) -> anyhow::Result<bool> {
        Ok(fs::read_to_string(&self.log_file).context("reading server log")?.contains(needle))
    }
}

impl std::ops::Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing server proc: {e:?}");
        }
        let _ = self.proc.wait();
    }
}
