//! Wire formats of the computational/I/O message protocol
//!
//! Three kinds of payload travel between ranks:
//!
//! - [`Msg`]: a single `i32` opcode, computational master to I/O master
//! - [`OpRequest`]: the parameters of an operation, broadcast from the
//!   computational group to the I/O group
//! - [`Outcome`]: the post-call state, broadcast from the I/O master to
//!   every rank of the union communicator
//!
//! Flushed buffer nodes travel as a [`NodeHeader`] followed by one
//! [`VarHeader`] plus payload (and optional fill value) per variable.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::comm::{CommError, CommResult};
use crate::constants::MAX_PATH_LENGTH;
use crate::error::{PioError, PioResult};
use crate::storage::{IoFormat, OpenMode, VarRecord};

/// Operation opcodes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    CreateFile = 1,
    OpenFile = 2,
    CloseFile = 3,
    DeleteFile = 4,
    Sync = 5,
    Exit = 6,
}

impl Msg {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(Msg::CreateFile),
            2 => Some(Msg::OpenFile),
            3 => Some(Msg::CloseFile),
            4 => Some(Msg::DeleteFile),
            5 => Some(Msg::Sync),
            6 => Some(Msg::Exit),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RequestHeader {
    handle: i32,
    format: i32,
    mode: i32,
    path_len: u32,
}

/// Parameters of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRequest {
    pub handle: i32,
    /// Format tag, 0 when the operation has none
    pub format: i32,
    pub mode: OpenMode,
    pub path: String,
}

impl OpRequest {
    pub fn for_path(path: &str, format: Option<IoFormat>, mode: OpenMode) -> Self {
        Self {
            handle: 0,
            format: format.map(|f| f.tag()).unwrap_or(0),
            mode,
            path: path.to_string(),
        }
    }

    pub fn for_handle(handle: i32) -> Self {
        Self {
            handle,
            format: 0,
            mode: OpenMode::READ,
            path: String::new(),
        }
    }

    pub fn io_format(&self) -> Option<IoFormat> {
        IoFormat::from_tag(self.format)
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = RequestHeader {
            handle: self.handle,
            format: self.format,
            mode: self.mode.bits(),
            path_len: self.path.len() as u32,
        };
        let mut buf = Vec::with_capacity(std::mem::size_of::<RequestHeader>() + self.path.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> CommResult<Self> {
        let (header, rest) = RequestHeader::read_from_prefix(bytes)
            .map_err(|_| CommError::Protocol("truncated request header".to_string()))?;
        let path_len = header.path_len as usize;
        if path_len > MAX_PATH_LENGTH {
            return Err(CommError::Protocol(format!(
                "request path length {} exceeds the limit of {}",
                path_len, MAX_PATH_LENGTH
            )));
        }
        if rest.len() != path_len {
            return Err(CommError::Protocol(format!(
                "request path length {} does not match payload of {} bytes",
                path_len,
                rest.len()
            )));
        }
        let path = std::str::from_utf8(rest)
            .map_err(|e| CommError::Protocol(format!("request path is not UTF-8: {}", e)))?;
        Ok(Self {
            handle: header.handle,
            format: header.format,
            mode: OpenMode(header.mode),
            path: path.to_string(),
        })
    }
}

/// Post-call state agreed by every rank
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Outcome {
    pub status: i32,
    pub detail: i32,
    pub handle: i32,
    pub format: i32,
    pub mode: i32,
}

impl Outcome {
    pub fn opened(handle: i32, format: IoFormat, mode: OpenMode) -> Self {
        Self {
            handle,
            format: format.tag(),
            mode: mode.bits(),
            ..Default::default()
        }
    }

    pub fn failed(err: &PioError) -> Self {
        let (status, detail) = err.to_wire();
        Self {
            status,
            detail,
            ..Default::default()
        }
    }

    pub fn into_result(self) -> PioResult<Outcome> {
        match PioError::from_wire(self.status, self.detail) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    pub fn decode(bytes: &[u8]) -> CommResult<Self> {
        Outcome::read_from_bytes(bytes)
            .map_err(|_| CommError::Protocol(format!("outcome of {} bytes", bytes.len())))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct NodeHeader {
    decomp_id: i32,
    nvars: u32,
}

const HAS_FRAME: i32 = 0x1;
const HAS_FILL: i32 = 0x2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct VarHeader {
    var_id: i32,
    flags: i32,
    frame: i64,
    data_len: u64,
    fill_len: u64,
}

/// Encode the contents of one buffer node
pub fn encode_node(decomp_id: Option<i32>, records: &[VarRecord]) -> Vec<u8> {
    let header = NodeHeader {
        decomp_id: decomp_id.unwrap_or(-1),
        nvars: records.len() as u32,
    };
    let mut buf = header.as_bytes().to_vec();
    for record in records {
        let mut flags = 0;
        if record.frame.is_some() {
            flags |= HAS_FRAME;
        }
        if record.fill.is_some() {
            flags |= HAS_FILL;
        }
        let fill = record.fill.as_deref().unwrap_or(&[]);
        let var = VarHeader {
            var_id: record.var_id,
            flags,
            frame: record.frame.unwrap_or(0),
            data_len: record.data.len() as u64,
            fill_len: fill.len() as u64,
        };
        buf.extend_from_slice(var.as_bytes());
        buf.extend_from_slice(&record.data);
        buf.extend_from_slice(fill);
    }
    buf
}

fn take<'a>(bytes: &mut &'a [u8], len: u64) -> CommResult<&'a [u8]> {
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= bytes.len())
        .ok_or_else(|| CommError::Protocol("node payload truncated".to_string()))?;
    let (head, rest) = bytes.split_at(len);
    *bytes = rest;
    Ok(head)
}

/// Decode a buffer node produced by [`encode_node`]
pub fn decode_node(bytes: &[u8]) -> CommResult<Vec<VarRecord>> {
    let (header, mut rest) = NodeHeader::read_from_prefix(bytes)
        .map_err(|_| CommError::Protocol("truncated node header".to_string()))?;
    let mut records = Vec::with_capacity(header.nvars as usize);
    for _ in 0..header.nvars {
        let (var, tail) = VarHeader::read_from_prefix(rest)
            .map_err(|_| CommError::Protocol("truncated variable header".to_string()))?;
        rest = tail;
        let data = take(&mut rest, var.data_len)?.to_vec();
        let fill = take(&mut rest, var.fill_len)?;
        records.push(VarRecord {
            var_id: var.var_id,
            frame: (var.flags & HAS_FRAME != 0).then_some(var.frame),
            data,
            fill: (var.flags & HAS_FILL != 0).then(|| fill.to_vec()),
        });
    }
    if !rest.is_empty() {
        return Err(CommError::Protocol(format!(
            "{} trailing bytes after node",
            rest.len()
        )));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status;

    #[test]
    fn test_msg_codes() {
        for msg in [
            Msg::CreateFile,
            Msg::OpenFile,
            Msg::CloseFile,
            Msg::DeleteFile,
            Msg::Sync,
            Msg::Exit,
        ] {
            assert_eq!(Msg::from_i32(msg as i32), Some(msg));
        }
        assert_eq!(Msg::from_i32(0), None);
    }

    #[test]
    fn test_request_wire() {
        let req = OpRequest::for_path(
            "out/grid.nc",
            Some(IoFormat::Parallel),
            OpenMode::WRITE | OpenMode::NOCLOBBER,
        );
        let back = OpRequest::decode(&req.encode()).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.io_format(), Some(IoFormat::Parallel));

        let mut bytes = req.encode();
        bytes.pop();
        assert!(OpRequest::decode(&bytes).is_err());
        assert!(OpRequest::decode(&[0u8; 3]).is_err());

        let long = OpRequest::for_path(&"z".repeat(MAX_PATH_LENGTH + 1), None, OpenMode::READ);
        match OpRequest::decode(&long.encode()) {
            Err(CommError::Protocol(msg)) => assert!(msg.contains("exceeds"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outcome_carries_error() {
        let err = PioError::Backend { code: 2 };
        let outcome = Outcome::decode(Outcome::failed(&err).as_bytes()).unwrap();
        let back = outcome.into_result().unwrap_err();
        assert_eq!(back.status(), status::EBACKEND);
        assert_eq!(back.raw_code(), Some(2));

        let ok = Outcome::opened(7, IoFormat::Classic, OpenMode::WRITE);
        assert_eq!(ok.into_result().unwrap().handle, 7);
        assert!(Outcome::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_node_preserves_optional_fields() {
        let records = vec![
            VarRecord {
                var_id: 3,
                frame: Some(12),
                data: vec![1, 2, 3, 4],
                fill: Some(vec![0xff; 4]),
            },
            VarRecord {
                var_id: 4,
                frame: None,
                data: Vec::new(),
                fill: None,
            },
        ];
        let bytes = encode_node(Some(9), &records);
        assert_eq!(decode_node(&bytes).unwrap(), records);
        assert!(decode_node(&bytes[..bytes.len() - 1]).is_err());
    }
}
