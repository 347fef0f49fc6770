use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
};

use serde_json::{json, Value};

use crate::Error;

/// A QMP session over the VM monitor socket.
///
/// The monitor speaks newline-delimited JSON: a greeting on connect, then
/// one response object per command, with asynchronous event objects
/// interleaved (and skipped here).
pub struct QmpClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl QmpClient {
    /// Connects and performs the capabilities handshake.
    pub fn connect(path: &Path) -> Result<Self, Error> {
        let stream = UnixStream::connect(path)?;
        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
        };

        let greeting = client.read_object()?;
        if greeting.get("QMP").is_none() {
            return Err(Error::Protocol("missing QMP greeting"));
        }

        client.execute("qmp_capabilities", None)?;
        Ok(client)
    }

    fn read_object(&mut self) -> Result<Value, Error> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::Protocol("monitor closed the connection"));
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Executes one QMP command and returns its `return` member.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, Error> {
        let mut request = json!({ "execute": command });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;

        loop {
            let reply = self.read_object()?;

            if reply.get("event").is_some() {
                continue;
            }
            if let Some(value) = reply.get("return") {
                return Ok(value.clone());
            }
            if let Some(error) = reply.get("error") {
                let desc = error
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                return Err(Error::Monitor(desc));
            }

            return Err(Error::Protocol("reply is neither return nor error"));
        }
    }

    /// Runs a human-monitor command and returns its text output.
    pub fn hmp(&mut self, command_line: &str) -> Result<String, Error> {
        let reply = self.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )?;

        reply
            .as_str()
            .map(str::to_string)
            .ok_or(Error::Protocol("human-monitor-command returned non-text"))
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, thread};

    use super::*;

    /// A scripted monitor endpoint on the other side of a socketpair.
    fn scripted_monitor(replies: Vec<String>) -> (UnixStream, thread::JoinHandle<Vec<String>>) {
        let (client, server) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || {
            let mut reader = BufReader::new(server.try_clone().unwrap());
            let mut server = server;
            let mut received = Vec::new();

            server
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .unwrap();

            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                received.push(line.trim().to_string());
                server.write_all(reply.as_bytes()).unwrap();
                server.write_all(b"\n").unwrap();
            }

            // Drain until the client hangs up.
            let mut rest = String::new();
            let _ = reader.read_to_string(&mut rest);
            received
        });

        (client, handle)
    }

    #[test]
    fn handshake_and_execute() {
        let (stream, handle) = scripted_monitor(vec![
            r#"{"return": {}}"#.to_string(),
            r#"{"return": {"name": "testvm"}}"#.to_string(),
        ]);

        let writer = stream.try_clone().unwrap();
        let mut client = QmpClient {
            reader: BufReader::new(stream),
            writer,
        };

        let greeting = client.read_object().unwrap();
        assert!(greeting.get("QMP").is_some());
        client.execute("qmp_capabilities", None).unwrap();

        let name = client.execute("query-name", None).unwrap();
        assert_eq!(name["name"], "testvm");

        drop(client);
        let sent = handle.join().unwrap();
        assert_eq!(sent[0], r#"{"execute":"qmp_capabilities"}"#);
        assert_eq!(sent[1], r#"{"execute":"query-name"}"#);
    }

    #[test]
    fn events_are_skipped_until_the_return() {
        let (stream, handle) = scripted_monitor(vec![format!(
            "{}\n{}",
            r#"{"event": "RESUME", "timestamp": {"seconds": 0}}"#,
            r#"{"return": {}}"#
        )]);

        let writer = stream.try_clone().unwrap();
        let mut client = QmpClient {
            reader: BufReader::new(stream),
            writer,
        };

        client.read_object().unwrap();
        client.execute("cont", None).unwrap();

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn monitor_errors_surface_as_errors() {
        let (stream, handle) = scripted_monitor(vec![
            r#"{"error": {"class": "CommandNotFound", "desc": "nope"}}"#.to_string(),
        ]);

        let writer = stream.try_clone().unwrap();
        let mut client = QmpClient {
            reader: BufReader::new(stream),
            writer,
        };

        client.read_object().unwrap();
        let error = client.execute("bogus-command", None).unwrap_err();
        assert!(matches!(error, Error::Monitor(desc) if desc == "nope"));

        drop(client);
        handle.join().unwrap();
    }
}
