//! Buffered I/O dispatcher: a nonblocking socket multiplexer with LINE/CHARACTER(n)/ANY framing
//! policies and zero-copy `sendfile` transmission, built on one [`reactor::Reactor`] registration
//! per socket.
//!
//! Grounded on the source's `src/buffer.c` state machine and on `neutronium::net::channel`'s
//! buffer/register/error plumbing, generalized from that crate's fixed length-prefixed frame
//! protocol to this crate's three framing policies and its file-transfer path.

pub mod buffer;
pub mod error;
pub mod policy;

mod dispatcher;
mod sendfile;

pub use dispatcher::{Channel, Dispatcher, ErrorCallback, Handle, ReadCallback, WriteCallback};
pub use error::Error;
pub use policy::Policy;

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use reactor::Reactor;
    use std::cell::{Cell, RefCell};
    use std::io::Write as _;
    use std::net::SocketAddr;
    use std::rc::Rc;
    use std::time::Duration;

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local_addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(local_addr).unwrap();
        client.set_nonblocking(false).unwrap();

        // Accept synchronously; this harness only needs the connection to exist.
        let mut server_side = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok((stream, _)) => {
                    server_side = Some(stream);
                    break;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }

        (server_side.expect("peer never connected"), client)
    }

    #[test]
    fn line_framing_delivers_each_terminated_line() {
        let (server_side, mut client) = connected_pair();
        let reactor = Reactor::shared().unwrap();

        let lines: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let lines_clone = lines.clone();

        let handle = Dispatcher::create(
            reactor.clone(),
            server_side,
            Policy::line(),
            None,
            None,
            support::logging::discard(),
            Box::new(move |frame: &[u8], _policy: &mut Policy| {
                lines_clone.borrow_mut().push(frame.to_vec());
                true
            }),
            Box::new(|| true),
            Box::new(|_err| {}),
        )
        .unwrap();
        let _ = &handle;

        client.write_all(b"HELO example.com\r\nMAIL FROM:<a@b>\r\n").unwrap();

        for _ in 0..20 {
            reactor.borrow_mut().turn().unwrap();
            if lines.borrow().len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let got = lines.borrow();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], b"HELO example.com");
        assert_eq!(got[1], b"MAIL FROM:<a@b>");
    }

    /// A read callback switches LINE -> CHARACTER(4) on the very first frame; the scan must
    /// restart under the new policy on the next byte rather than waiting for a fresh `turn`.
    #[test]
    fn read_callback_switches_policy_mid_stream() {
        let (server_side, mut client) = connected_pair();
        let reactor = Reactor::shared().unwrap();

        let frames: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let frames_clone = frames.clone();
        let switched = Rc::new(Cell::new(false));
        let switched_clone = switched.clone();

        let handle = Dispatcher::create(
            reactor.clone(),
            server_side,
            Policy::line(),
            None,
            None,
            support::logging::discard(),
            Box::new(move |frame: &[u8], policy: &mut Policy| {
                frames_clone.borrow_mut().push(frame.to_vec());
                if !switched_clone.get() {
                    *policy = Policy::Character(4);
                    switched_clone.set(true);
                }
                true
            }),
            Box::new(|| true),
            Box::new(|_err| {}),
        )
        .unwrap();
        let _ = &handle;

        // "GET\n" is the LINE-framed handshake; "0123" is the first CHARACTER(4) body frame,
        // delivered in the same read pass since both arrive in one `write_all`; "xyz" is held
        // back as an incomplete residual frame.
        client.write_all(b"GET\n0123xyz").unwrap();

        for _ in 0..20 {
            reactor.borrow_mut().turn().unwrap();
            if frames.borrow().len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let got = frames.borrow();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], b"GET");
        assert_eq!(got[1], b"0123");
    }

    #[test]
    fn write_then_error_reports_in_order() {
        let (server_side, client) = connected_pair();
        let reactor = Reactor::shared().unwrap();

        let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let errors_clone = errors.clone();

        let handle = Dispatcher::create(
            reactor.clone(),
            server_side,
            Policy::Any,
            None,
            None,
            support::logging::discard(),
            Box::new(|_frame: &[u8], _policy: &mut Policy| true),
            Box::new(|| true),
            Box::new(move |err| errors_clone.borrow_mut().push(err.to_string())),
        )
        .unwrap();

        Dispatcher::write_copy(&handle, b"220 greeting\r\n", false).unwrap();

        drop(client);

        for _ in 0..20 {
            reactor.borrow_mut().turn().unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }

        // Either the peer close is observed as EOF on a later read, or nothing fails if the
        // kernel hasn't surfaced it yet in this harness; what must hold is that no error fired
        // before the greeting was actually handed to the socket.
        if let Some(first) = errors.borrow().first() {
            assert!(first.contains("closed") || first.contains("reset"));
        }
    }
}
