use std::{
    io::{Read, Write},
    net::TcpStream,
};

use crate::Error;

/// A minimal GDB remote-serial client for the VM's stub port.
///
/// Only the memory packets are used: `m` for reads and `M` for writes.
/// This path is slower than the patched-monitor channel but works against
/// a stock VM monitor with `-gdb` enabled.
pub struct GdbClient {
    stream: TcpStream,
}

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(text: &str) -> Result<Vec<u8>, Error> {
    if text.len() % 2 != 0 {
        return Err(Error::Protocol("odd-length hex reply"));
    }

    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| Error::Protocol("malformed hex reply"))
        })
        .collect()
}

impl GdbClient {
    /// Connects to the stub.
    pub fn connect(addr: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    fn send_packet(&mut self, payload: &str) -> Result<(), Error> {
        let framed = format!("${payload}#{:02x}", checksum(payload.as_bytes()));

        loop {
            self.stream.write_all(framed.as_bytes())?;

            let mut ack = [0u8; 1];
            self.stream.read_exact(&mut ack)?;
            match ack[0] {
                b'+' => return Ok(()),
                b'-' => continue,
                _ => return Err(Error::Protocol("unexpected acknowledgement")),
            }
        }
    }

    fn recv_packet(&mut self) -> Result<String, Error> {
        let mut byte = [0u8; 1];

        // Skip to the packet start.
        loop {
            self.stream.read_exact(&mut byte)?;
            if byte[0] == b'$' {
                break;
            }
        }

        let mut payload = Vec::new();
        loop {
            self.stream.read_exact(&mut byte)?;
            if byte[0] == b'#' {
                break;
            }
            payload.push(byte[0]);
        }

        let mut sum = [0u8; 2];
        self.stream.read_exact(&mut sum)?;
        let expected = u8::from_str_radix(
            std::str::from_utf8(&sum).map_err(|_| Error::Protocol("bad checksum field"))?,
            16,
        )
        .map_err(|_| Error::Protocol("bad checksum field"))?;

        if checksum(&payload) != expected {
            self.stream.write_all(b"-")?;
            return Err(Error::Protocol("checksum mismatch"));
        }

        self.stream.write_all(b"+")?;
        String::from_utf8(payload).map_err(|_| Error::Protocol("non-ascii payload"))
    }

    fn transact(&mut self, payload: &str) -> Result<String, Error> {
        self.send_packet(payload)?;
        let reply = self.recv_packet()?;

        if reply.starts_with('E') && reply.len() == 3 {
            return Err(Error::Stub(reply));
        }
        Ok(reply)
    }

    /// Reads guest memory.
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        let reply = self.transact(&format!("m{addr:x},{:x}", buf.len()))?;
        let bytes = decode_hex(&reply)?;

        if bytes.len() != buf.len() {
            return Err(Error::Protocol("short memory reply"));
        }
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    /// Writes guest memory.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        let reply = self.transact(&format!(
            "M{addr:x},{:x}:{}",
            data.len(),
            encode_hex(data)
        ))?;

        if reply != "OK" {
            return Err(Error::Protocol("write not acknowledged"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;

    /// A stub that serves reads from a fixed buffer and applies writes.
    fn spawn_stub(memory: Vec<u8>) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut memory = memory;

            loop {
                let mut byte = [0u8; 1];
                if stream.read_exact(&mut byte).is_err() {
                    break;
                }
                if byte[0] != b'$' {
                    continue;
                }

                let mut payload = Vec::new();
                loop {
                    stream.read_exact(&mut byte).unwrap();
                    if byte[0] == b'#' {
                        break;
                    }
                    payload.push(byte[0]);
                }
                let mut sum = [0u8; 2];
                stream.read_exact(&mut sum).unwrap();
                stream.write_all(b"+").unwrap();

                let text = String::from_utf8(payload).unwrap();
                let reply = if let Some(rest) = text.strip_prefix('m') {
                    let (addr, len) = rest.split_once(',').unwrap();
                    let addr = usize::from_str_radix(addr, 16).unwrap();
                    let len = usize::from_str_radix(len, 16).unwrap();
                    encode_hex(&memory[addr..addr + len])
                } else if let Some(rest) = text.strip_prefix('M') {
                    let (range, data) = rest.split_once(':').unwrap();
                    let (addr, _len) = range.split_once(',').unwrap();
                    let addr = usize::from_str_radix(addr, 16).unwrap();
                    let bytes = decode_hex(data).unwrap();
                    memory[addr..addr + bytes.len()].copy_from_slice(&bytes);
                    "OK".to_string()
                } else {
                    "".to_string()
                };

                let framed = format!("${reply}#{:02x}", checksum(reply.as_bytes()));
                stream.write_all(framed.as_bytes()).unwrap();

                // Client acknowledgement.
                let _ = stream.read_exact(&mut byte);
            }

            memory
        });

        (addr, handle)
    }

    #[test]
    fn read_round_trips_through_the_stub() {
        let memory: Vec<u8> = (0..=255).cycle().take(0x2000).collect();
        let (addr, handle) = spawn_stub(memory.clone());

        let mut client = GdbClient::connect(&addr).unwrap();
        let mut buf = [0u8; 16];
        client.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf[..], &memory[0x100..0x110]);

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn write_is_applied_and_acknowledged() {
        let (addr, handle) = spawn_stub(vec![0u8; 0x1000]);

        let mut client = GdbClient::connect(&addr).unwrap();
        client.write(0x80, &[1, 2, 3, 4]).unwrap();

        drop(client);
        let memory = handle.join().unwrap();
        assert_eq!(&memory[0x80..0x84], &[1, 2, 3, 4]);
    }

    #[test]
    fn hex_helpers_round_trip() {
        let data = [0x00, 0x7f, 0xff, 0x10];
        assert_eq!(decode_hex(&encode_hex(&data)).unwrap(), data);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }
}
