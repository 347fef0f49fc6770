use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
};

use zerocopy::{Immutable, IntoBytes};

use crate::Error;

const REQ_QUIT: u8 = 0;
const REQ_READ: u8 = 1;
const REQ_WRITE: u8 = 2;

/// The request header of the patched-monitor physical-memory channel.
///
/// Layout matches the C struct on the monitor side, including the padding
/// the compiler inserts before the 64-bit fields.
#[repr(C)]
#[derive(IntoBytes, Immutable)]
struct PmemRequest {
    typ: u8,
    _pad: [u8; 7],
    address: u64,
    length: u64,
}

impl PmemRequest {
    fn new(typ: u8, address: u64, length: u64) -> Self {
        Self {
            typ,
            _pad: [0; 7],
            address,
            length,
        }
    }
}

/// A connection to the patched monitor's physical-memory socket.
///
/// Reads return the payload followed by one status byte; writes send the
/// payload after the header and receive one status byte back.
pub struct PmemClient {
    stream: UnixStream,
}

impl PmemClient {
    /// Connects to the socket the monitor created for `pmemaccess`.
    pub fn connect(path: &Path) -> Result<Self, Error> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Reads guest physical memory.
    pub fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        let request = PmemRequest::new(REQ_READ, address, buf.len() as u64);
        self.stream.write_all(request.as_bytes())?;

        self.stream.read_exact(buf)?;

        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status)?;
        if status[0] == 0 {
            return Err(Error::Protocol("monitor rejected the read"));
        }
        Ok(())
    }

    /// Writes guest physical memory.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let request = PmemRequest::new(REQ_WRITE, address, data.len() as u64);
        self.stream.write_all(request.as_bytes())?;
        self.stream.write_all(data)?;

        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status)?;
        if status[0] == 0 {
            return Err(Error::Protocol("monitor rejected the write"));
        }
        Ok(())
    }
}

impl Drop for PmemClient {
    fn drop(&mut self) {
        let request = PmemRequest::new(REQ_QUIT, 0, 0);
        let _ = self.stream.write_all(request.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn request_header_layout() {
        let request = PmemRequest::new(REQ_READ, 0x1000, 16);
        let bytes = request.as_bytes();

        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes[0], REQ_READ);
        assert_eq!(&bytes[8..16], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &16u64.to_le_bytes());
    }

    #[test]
    fn read_and_write_against_a_scripted_peer() {
        let (client_stream, mut server) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || {
            let mut memory = vec![0u8; 0x2000];
            for (i, b) in memory.iter_mut().enumerate() {
                *b = (i % 13) as u8;
            }

            loop {
                let mut header = [0u8; 24];
                if server.read_exact(&mut header).is_err() {
                    break;
                }
                let typ = header[0];
                let address =
                    u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
                let length = u64::from_le_bytes(header[16..24].try_into().unwrap()) as usize;

                match typ {
                    REQ_READ => {
                        server.write_all(&memory[address..address + length]).unwrap();
                        server.write_all(&[1]).unwrap();
                    }
                    REQ_WRITE => {
                        let mut data = vec![0u8; length];
                        server.read_exact(&mut data).unwrap();
                        memory[address..address + length].copy_from_slice(&data);
                        server.write_all(&[1]).unwrap();
                    }
                    _ => break,
                }
            }

            memory
        });

        let mut client = PmemClient {
            stream: client_stream,
        };

        let mut buf = [0u8; 8];
        client.read(0x100, &mut buf).unwrap();
        assert_eq!(
            buf,
            [
                (0x100 % 13) as u8,
                (0x101 % 13) as u8,
                (0x102 % 13) as u8,
                (0x103 % 13) as u8,
                (0x104 % 13) as u8,
                (0x105 % 13) as u8,
                (0x106 % 13) as u8,
                (0x107 % 13) as u8
            ]
        );

        client.write(0x200, &[9, 8, 7]).unwrap();
        drop(client);

        let memory = handle.join().unwrap();
        assert_eq!(&memory[0x200..0x203], &[9, 8, 7]);
    }
}
