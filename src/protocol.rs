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

//! The wire protocol spoken between `delta-remote --client` and
//! `delta-remote --server`.
//!
//! The protocol is a stream of tagged frames over a single tcp
//! connection. There is no handshake: the server spawns its configured
//! viewer command as soon as a connection lands, and the client's
//! first frame is normally a Resize reporting the local terminal size.
//!
//! There is no authentication and no encryption. Anyone who can reach
//! the listening address can open a session, which is why the server
//! binds to loopback unless explicitly told otherwise.

use std::io::{Read, Write};

use anyhow::anyhow;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::tty;

/// FrameKind is a tag that indicates what type of frame is being
/// transmitted through the socket.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FrameKind {
    /// Opaque terminal bytes. After the kind tag, the frame has a
    /// 4 byte little endian length prefix followed by the data.
    Data = 0,
    /// A window size change. After the kind tag, the frame has
    /// exactly 4 bytes of data: little endian rows then cols.
    Resize = 1,
    /// The session is over. No payload.
    Close = 2,
    /// The session could not be established or has failed. After the
    /// kind tag, a 4 byte little endian length prefix followed by a
    /// utf8 diagnostic meant for the user.
    Error = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Resize),
            2 => Ok(FrameKind::Close),
            3 => Ok(FrameKind::Error),
            _ => Err(anyhow!("unknown frame kind {}", v)),
        }
    }
}

/// One frame of the session protocol. Data and Error frames borrow
/// their payload from the read buffer to keep the relay loops
/// allocation free.
#[derive(Debug, PartialEq)]
pub enum Frame<'data> {
    Data(&'data [u8]),
    Resize(tty::Size),
    Close,
    Error(&'data [u8]),
}

impl<'data> Frame<'data> {
    pub fn write_to<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: Write,
    {
        match self {
            Frame::Data(buf) => {
                w.write_u8(FrameKind::Data as u8)?;
                w.write_u32::<LittleEndian>(buf.len() as u32)?;
                w.write_all(buf)?;
            }
            Frame::Resize(size) => {
                w.write_u8(FrameKind::Resize as u8)?;
                w.write_u16::<LittleEndian>(size.rows)?;
                w.write_u16::<LittleEndian>(size.cols)?;
            }
            Frame::Close => {
                w.write_u8(FrameKind::Close as u8)?;
            }
            Frame::Error(msg) => {
                w.write_u8(FrameKind::Error as u8)?;
                w.write_u32::<LittleEndian>(msg.len() as u32)?;
                w.write_all(msg)?;
            }
        }

        Ok(())
    }

    /// Read the next frame from the stream, using the given buffer as
    /// backing storage for the payload. A frame longer than the buffer
    /// is a protocol error, not a resize request.
    pub fn read_into<R>(r: &mut R, buf: &'data mut [u8]) -> anyhow::Result<Self>
    where
        R: Read,
    {
        let kind = r.read_u8()?;
        match FrameKind::try_from(kind)? {
            FrameKind::Data => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                if len > buf.len() {
                    return Err(anyhow!(
                        "frame of size {} exceeds size limit of {} bytes",
                        len,
                        buf.len()
                    ));
                }
                r.read_exact(&mut buf[..len])?;
                Ok(Frame::Data(&buf[..len]))
            }
            FrameKind::Resize => {
                let rows = r.read_u16::<LittleEndian>()?;
                let cols = r.read_u16::<LittleEndian>()?;
                Ok(Frame::Resize(tty::Size { rows, cols }))
            }
            FrameKind::Close => Ok(Frame::Close),
            FrameKind::Error => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                if len > buf.len() {
                    return Err(anyhow!(
                        "error frame of size {} exceeds size limit of {} bytes",
                        len,
                        buf.len()
                    ));
                }
                r.read_exact(&mut buf[..len])?;
                Ok(Frame::Error(&buf[..len]))
            }
        }
    }
}

/// True for the io error kinds that just mean the peer went away,
/// which is the normal way a frame read loop ends.
pub fn is_hangup_error(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<std::io::Error>() {
        Some(io_err) => matches!(
            io_err.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        ),
        None => false,
    }
}
