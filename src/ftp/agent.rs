//! Per-client request dispatcher for the FTP service, plus the
//! termination-port listener that lets an out-of-band connection cancel an
//! in-flight transfer.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use tracing::{info, warn};

use crate::commands::ActiveCommands;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::ThreadSafeFileHandler;
use crate::ftp::{Request, Response, Terminate};
use crate::transfer::{ChunkedFileReceiver, ChunkedFileSender};
use crate::wire::MessageParser;

/// Observable state of a client connection. `Active` is the only
/// non-terminal state; [`Agent::handle`] returns once it observes any
/// other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Active,
    Disconnected,
    Error,
}

/// Drives one client's normal-commands connection to completion, dispatching
/// each [`Request`] against a shared [`ThreadSafeFileHandler`] and
/// [`ActiveCommands`] registry.
pub struct Agent {
    socket: TcpStream,
    files: Arc<ThreadSafeFileHandler>,
    commands: Arc<ActiveCommands>,
    parser: MessageParser<Request>,
}

impl Agent {
    pub fn new(
        socket: TcpStream,
        files: Arc<ThreadSafeFileHandler>,
        commands: Arc<ActiveCommands>,
    ) -> Self {
        Agent {
            socket,
            files,
            commands,
            parser: MessageParser::new(),
        }
    }

    /// Runs the request/response loop until the client quits, disconnects,
    /// or an unrecoverable error occurs.
    pub fn handle(&mut self) -> AgentState {
        loop {
            let request = match self.read_request() {
                Ok(Some(r)) => r,
                Ok(None) => return AgentState::Disconnected,
                Err(e) => {
                    warn!(error = %e, "ftp agent connection error");
                    return AgentState::Error;
                }
            };

            match self.dispatch(request) {
                Ok(AgentState::Active) => continue,
                Ok(other) => return other,
                Err(e) => {
                    warn!(error = %e, "ftp request failed");
                    let _ = self.respond(&Response::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn read_request(&mut self) -> Result<Option<Request>> {
        let mut buf = [0u8; 4096];
        while !self.parser.has_complete_message() {
            match self.socket.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.parser.feed(&buf[..n]),
                Err(e) => return Err(Error::wrapped(ErrorKind::Transport, e)),
            }
        }
        Ok(self.parser.take_message())
    }

    fn respond(&mut self, response: &Response) -> Result<()> {
        let frame = crate::wire::serialize(response)?;
        std::io::Write::write_all(&mut self.socket, &frame)
            .map_err(|e| Error::wrapped(ErrorKind::Transport, e))
    }

    fn dispatch(&mut self, request: Request) -> Result<AgentState> {
        match request {
            Request::Get { filename } => self.handle_get(filename),
            Request::Put { filename } => self.handle_put(filename),
            Request::Delete { filename } => {
                self.files.delete(&filename)?;
                self.respond(&Response::Empty)?;
                Ok(AgentState::Active)
            }
            Request::List => {
                let filenames = self.files.list()?;
                self.respond(&Response::List { filenames })?;
                Ok(AgentState::Active)
            }
            Request::ChangeDir { dir_name, go_up } => {
                self.files.change_dir(&dir_name, go_up)?;
                self.respond(&Response::Empty)?;
                Ok(AgentState::Active)
            }
            Request::MakeDir { dir_name } => {
                self.files.make_dir(&dir_name)?;
                self.respond(&Response::Empty)?;
                Ok(AgentState::Active)
            }
            Request::Pwd => {
                let dir_name = self.files.pwd();
                self.respond(&Response::Pwd { dir_name })?;
                Ok(AgentState::Active)
            }
            Request::Quit => Ok(AgentState::Disconnected),
        }
    }

    fn handle_get(&mut self, filename: String) -> Result<AgentState> {
        let contents = self.files.get(&filename)?;
        let id = self.commands.generate_id();
        self.respond(&Response::Get { command_id: id })?;

        let mut sender = ChunkedFileSender::new(&mut self.socket);
        sender.set_file_contents(contents);
        let mut terminated = false;
        while !sender.sent_complete_file() {
            if !self.commands.contains(id) {
                terminated = true;
                break;
            }
            if sender.send_next_chunk()? == 0 {
                break;
            }
        }

        self.commands.delete(id);
        info!(id, terminated, "get transfer finished");
        Ok(AgentState::Active)
    }

    fn handle_put(&mut self, filename: String) -> Result<AgentState> {
        let id = self.commands.generate_id();
        self.respond(&Response::Put { command_id: id })?;

        let mut receiver = ChunkedFileReceiver::new(&mut self.socket);
        let mut terminated = false;
        while !receiver.has_complete_file() {
            if !self.commands.contains(id) {
                terminated = true;
                receiver.clean_up()?;
                break;
            }
            receiver.receive_next_chunk()?;
        }

        self.commands.delete(id);

        if terminated {
            info!(id, "put transfer terminated, discarding bytes");
        } else {
            let contents = receiver.take_file_contents();
            self.files.put(&filename, &contents)?;
        }

        self.respond(&Response::Empty)?;
        Ok(AgentState::Active)
    }
}

/// Blocks accepting connections on `listener`, reading one [`Terminate`]
/// request per connection and removing its command id from `commands`.
/// Runs until the listener is closed (e.g. by dropping it from another
/// thread) or an unrecoverable accept error occurs.
pub fn run_termination_listener(listener: TcpListener, commands: Arc<ActiveCommands>) {
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "termination listener accept failed, exiting");
                return;
            }
        };
        let commands = Arc::clone(&commands);
        std::thread::spawn(move || {
            if let Err(e) = handle_termination_connection(stream, &commands) {
                warn!(error = %e, peer = %addr, "termination request failed");
            }
        });
    }
}

fn handle_termination_connection(mut stream: TcpStream, commands: &ActiveCommands) -> Result<()> {
    let mut parser = MessageParser::<Terminate>::new();
    let mut buf = [0u8; 64];
    while !parser.has_complete_message() {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => parser.feed(&buf[..n]),
            Err(e) => return Err(Error::wrapped(ErrorKind::Transport, e)),
        }
    }
    if let Some(Terminate { command_id }) = parser.take_message() {
        info!(command_id, "terminating command");
        commands.delete(command_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use std::io::Write;
    use std::net::TcpStream as StdStream;
    use std::thread;

    fn handler() -> Arc<ThreadSafeFileHandler> {
        // Leak the temp dir for the test's lifetime rather than letting it
        // clean up mid-assertion.
        let dir = tempfile::tempdir().unwrap().into_path();
        Arc::new(ThreadSafeFileHandler::new(dir))
    }

    #[test]
    fn put_then_get_round_trips_through_the_agent() {
        let files = handler();
        let commands = Arc::new(ActiveCommands::new());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let files_srv = Arc::clone(&files);
        let commands_srv = Arc::clone(&commands);
        let server_thread = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut agent = Agent::new(stream, files_srv, commands_srv);
            agent.handle()
        });

        let mut client = StdStream::connect(addr).unwrap();
        client
            .write_all(&wire::serialize(&Request::Put {
                filename: "x.txt".to_owned(),
            }).unwrap())
            .unwrap();

        let mut parser = MessageParser::<Response>::new();
        let mut buf = [0u8; 256];
        while !parser.has_complete_message() {
            let n = client.read_exact_or_partial(&mut buf);
            parser.feed(&buf[..n]);
        }
        let response = parser.take_message().unwrap();
        let command_id = match response {
            Response::Put { command_id } => command_id,
            other => panic!("unexpected response: {:?}", other),
        };
        assert!(command_id > 0);

        let mut sender = ChunkedFileSender::new(&mut client);
        sender.set_file_contents(vec![1, 2, 3, 4, 5]);
        while !sender.sent_complete_file() {
            sender.send_next_chunk().unwrap();
        }

        let mut parser = MessageParser::<Response>::new();
        while !parser.has_complete_message() {
            let n = client.read_exact_or_partial(&mut buf);
            parser.feed(&buf[..n]);
        }
        assert_eq!(parser.take_message().unwrap(), Response::Empty);

        client
            .write_all(&wire::serialize(&Request::Quit).unwrap())
            .unwrap();
        drop(client);

        assert_eq!(server_thread.join().unwrap(), AgentState::Disconnected);
        assert_eq!(files.get("x.txt").unwrap(), vec![1, 2, 3, 4, 5]);
    }

    trait ReadExactOrPartial {
        fn read_exact_or_partial(&mut self, buf: &mut [u8]) -> usize;
    }

    impl ReadExactOrPartial for StdStream {
        fn read_exact_or_partial(&mut self, buf: &mut [u8]) -> usize {
            self.read(buf).unwrap()
        }
    }
}
