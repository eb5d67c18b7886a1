//! Integration test for the framed `Channel`, exercising a real
//! `AF_UNIX` socket pair end to end (header framing, the NUL-terminated
//! argv codec, fd passing via `SCM_RIGHTS`, and the response path).
//!
//! Grounded on `privsep/tests/imsg.rs`'s `test_imsg`: a socket pair, one
//! side sending while the other receives, both driven by `tokio::test`.

use hasher_priv_proto::{
    wire::{decode_strings, encode_strings, CommandHeader, ResponseHeader, Status},
    Channel, CommandType,
};
use std::os::unix::io::AsRawFd;
use tokio::net::UnixStream;

#[tokio::test]
async fn command_round_trips_over_a_real_socket() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let client = Channel::new(a);
    let server = Channel::new(b);

    let argv = encode_strings(&["/bin/true", "--flag"]);
    client.send_command(CommandType::TaskArguments, &argv).await.unwrap();

    let (header, payload) = server.recv_command().await.unwrap().expect("one command");
    assert_eq!(header.command_type, CommandType::TaskArguments as u32);
    assert_eq!(header.datalen as usize, argv.len());
    let decoded = decode_strings(&payload, 2).unwrap();
    assert_eq!(decoded, vec!["/bin/true".to_string(), "--flag".to_string()]);
}

#[tokio::test]
async fn recv_command_returns_none_on_clean_eof() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    drop(a);
    let server = Channel::new(b);
    assert!(server.recv_command().await.unwrap().is_none());
}

#[tokio::test]
async fn response_round_trips_with_trailing_message() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let server = Channel::new(a);
    let client = Channel::new(b);

    let message = "mount: requires 2, got 0";
    server
        .send_response(ResponseHeader::failed(message.len() as i64), Some(message))
        .await
        .unwrap();

    let (header, received) = client.recv_response().await.unwrap();
    assert_eq!(header.status, Status::Failed as i32);
    assert_eq!(received.as_deref(), Some(message));
}

#[tokio::test]
async fn done_response_has_no_trailing_message() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let server = Channel::new(a);
    let client = Channel::new(b);

    server.send_response(ResponseHeader::done(), None).await.unwrap();

    let (header, received) = client.recv_response().await.unwrap();
    assert_eq!(header.status, Status::Done as i32);
    assert_eq!(received, None);
}

/// `TASK_FDS` passes exactly three descriptors via `SCM_RIGHTS`; this
/// mirrors what a session server's conversation does with stdin/stdout/
/// stderr (spec.md §4.1).
#[tokio::test]
async fn fds3_round_trips_three_descriptors() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let client = Channel::new(a);
    let server = Channel::new(b);

    let (p0, p1) = UnixStream::pair().expect("socketpair");
    let (p2, p3) = UnixStream::pair().expect("socketpair");
    let (p4, p5) = UnixStream::pair().expect("socketpair");
    // Keep the peer ends alive for the duration of the test so the fds
    // we pass stay meaningfully open sockets rather than already-closed
    // descriptors.
    let _peers = (p1, p3, p5);

    let fds = [p0.as_raw_fd(), p2.as_raw_fd(), p4.as_raw_fd()];
    client.send_fds3(fds).await.unwrap();
    // The sending side still owns its copies; `send_fds3` does not close
    // them, so drop them explicitly once sent.
    drop((p0, p2, p4));

    let received = server.recv_fds3().await.unwrap();
    assert_eq!(received.len(), 3);
    for fd in &received {
        assert!(fd.as_raw_fd() >= 0);
    }
}

/// Regression test for the ancillary-data-loss bug: `TASK_FDS`'s one
/// dummy payload byte rides in the same `sendmsg(2)` call as the three
/// `SCM_RIGHTS` descriptors, so the receiver must read the header with
/// [`Channel::recv_header`] and immediately follow with
/// [`Channel::recv_fds3`] — never with the generic [`Channel::recv_command`],
/// whose plain payload read would consume that byte and let the kernel
/// silently drop the fds.
#[tokio::test]
async fn task_fds_header_then_fds3_recovers_descriptors_sent_together() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let client = Channel::new(a);
    let server = Channel::new(b);

    let (p0, p1) = UnixStream::pair().expect("socketpair");
    let (p2, p3) = UnixStream::pair().expect("socketpair");
    let (p4, p5) = UnixStream::pair().expect("socketpair");
    let _peers = (p1, p3, p5);

    let fds = [p0.as_raw_fd(), p2.as_raw_fd(), p4.as_raw_fd()];
    client.send_fds3(fds).await.unwrap();
    drop((p0, p2, p4));

    let header = server.recv_header().await.unwrap().expect("one command");
    assert_eq!(header.command_type, CommandType::TaskFds as u32);
    assert_eq!(header.datalen, 1);

    let received = server.recv_fds3().await.unwrap();
    assert_eq!(received.len(), 3);
    for fd in &received {
        assert!(fd.as_raw_fd() >= 0);
    }
}

#[tokio::test]
async fn peer_credentials_reports_the_current_process() {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let channel_a = Channel::new(a);
    let _b = b;

    let cred = channel_a.peer_credentials().unwrap();
    assert_eq!(cred.uid, nix::unistd::getuid().as_raw());
    assert_eq!(cred.gid, nix::unistd::getgid().as_raw());
    assert_eq!(cred.pid, nix::unistd::getpid().as_raw());
}

#[test]
fn command_header_as_bytes_round_trips_through_zerocopy() {
    use zerocopy::{AsBytes, FromBytes};

    let header = CommandHeader::new(CommandType::TaskRun, 0);
    let bytes = header.as_bytes();
    let decoded = CommandHeader::read_from(bytes).unwrap();
    assert_eq!(decoded.command_type, CommandType::TaskRun as u32);
    assert_eq!(decoded.datalen, 0);
}
