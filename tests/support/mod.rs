// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{net::TcpStream, path::PathBuf, time};

use anyhow::anyhow;

use delta_remote::{consts, protocol::Frame};

pub mod server;

pub fn delta_remote_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_delta-remote"))
}

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}

/// Collect Data payloads until the server sends Close. An Error frame
/// or a transport failure is an error.
pub fn read_until_close(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut collected = vec![];
    let mut buf = vec![0; consts::BUF_SIZE];
    loop {
        match Frame::read_into(stream, &mut buf)? {
            Frame::Data(bytes) => collected.extend_from_slice(bytes),
            Frame::Close => return Ok(collected),
            Frame::Error(msg) => {
                return Err(anyhow!("server error: {}", String::from_utf8_lossy(msg)))
            }
            Frame::Resize(_) => {}
        }
    }
}
