use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use yari::io::Buffer;
use yari::protocol::codec::{self, FAILURE_MARKER};
use yari::protocol::CommandCode;
use yari::{Client, Config, Error, Server};

fn start_server(threads: usize) -> SocketAddr {
    let config = Config {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        threads,
        slot_bits: 8,
        max_connections: 256,
        ..Default::default()
    };

    let server = Server::new(config).unwrap();
    let addr = server.local_addr();
    thread::spawn(move || server.run());
    addr
}

fn raw_connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn get_frame(buf: &mut Buffer, key: &[u8]) {
    codec::encode_int(buf, CommandCode::GET).unwrap();
    codec::encode_str(buf, key).unwrap();
}

fn set_frame(buf: &mut Buffer, key: &[u8], value: &[u8]) {
    codec::encode_int(buf, CommandCode::SET).unwrap();
    codec::encode_str(buf, key).unwrap();
    codec::encode_str(buf, value).unwrap();
}

fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    stream.read_exact(&mut out).unwrap();
    out
}

#[test]
fn test_set_get_overwrite() {
    let addr = start_server(2);
    let mut client = Client::connect(addr).unwrap();
    assert_eq!(client.peer_addr().unwrap(), addr);

    client.set(b"k", b"1234567890").unwrap();
    assert_eq!(&client.get(b"k").unwrap()[..], b"1234567890");

    client.set(b"k", b"ab").unwrap();
    assert_eq!(&client.get(b"k").unwrap()[..], b"ab");

    client.set(b"k", b"1234567890abcdef").unwrap();
    assert_eq!(&client.get(b"k").unwrap()[..], b"1234567890abcdef");

    client.close().unwrap();
}

#[test]
fn test_missing_key_reports_status() {
    let addr = start_server(2);
    let mut client = Client::connect(addr).unwrap();

    match client.get(b"missing") {
        Err(Error::Status(code)) => assert_eq!(code, libc::EINVAL as u64),
        other => panic!("unexpected result: {:?}", other.map(|v| v.to_vec())),
    }

    // connection still usable afterwards
    client.set(b"present", b"v").unwrap();
    assert_eq!(&client.get(b"present").unwrap()[..], b"v");
}

#[test]
fn test_many_clients_keep_their_order() {
    let addr = start_server(4);

    let handles: Vec<_> = (0..8)
        .map(|c| {
            thread::spawn(move || {
                let mut client = Client::connect(addr).unwrap();
                for i in 0..200 {
                    let key = format!("client-{}-key", c);
                    let value = format!("value-{}-{}", c, i);
                    client.set(key.as_bytes(), value.as_bytes()).unwrap();
                    // each response belongs to the request just sent
                    assert_eq!(&client.get(key.as_bytes()).unwrap()[..], value.as_bytes());
                }
                client.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_pipelined_frames_answered_in_order() {
    let addr = start_server(2);
    let mut stream = raw_connect(addr);

    let mut frames = Buffer::new();
    set_frame(&mut frames, b"p", b"first");
    get_frame(&mut frames, b"p");
    set_frame(&mut frames, b"p", b"second!");
    get_frame(&mut frames, b"p");
    stream.write_all(frames.readable()).unwrap();

    let expected: &[u8] = b"#:0~#:0~#:5~#:first~#:0~#:0~#:7~#:second!~";
    assert_eq!(read_exactly(&mut stream, expected.len()), expected);
}

#[test]
fn test_unknown_command_gets_failure_marker() {
    let addr = start_server(2);
    let mut stream = raw_connect(addr);

    let mut frame = Buffer::new();
    codec::encode_int(&mut frame, 7).unwrap();
    codec::encode_str(&mut frame, b"k").unwrap();
    stream.write_all(frame.readable()).unwrap();
    assert_eq!(read_exactly(&mut stream, 1), [FAILURE_MARKER]);

    // the connection survives
    let mut frame = Buffer::new();
    set_frame(&mut frame, b"after", b"ok");
    stream.write_all(frame.readable()).unwrap();
    assert_eq!(read_exactly(&mut stream, 4), b"#:0~");
}

#[test]
fn test_truncated_frame_reports_invalid_argument() {
    let addr = start_server(2);
    let mut stream = raw_connect(addr);

    stream.write_all(b"#:2~#:1~#:k~#:3~#:ab").unwrap();
    let expected = format!("#:{}~", libc::EINVAL);
    assert_eq!(read_exactly(&mut stream, expected.len()), expected.as_bytes());

    // nothing was stored and the server keeps serving
    let mut client = Client::connect(addr).unwrap();
    assert!(matches!(client.get(b"k"), Err(Error::Status(_))));
    client.set(b"k", b"fine").unwrap();
    assert_eq!(&client.get(b"k").unwrap()[..], b"fine");
}

#[test]
fn test_reconnects_reuse_slots() {
    let addr = start_server(3);

    for i in 0..100 {
        let mut client = Client::connect(addr).unwrap();
        let value = format!("round-{}", i);
        client.set(b"shared", value.as_bytes()).unwrap();
        assert_eq!(&client.get(b"shared").unwrap()[..], value.as_bytes());
        drop(client);

        if i % 20 == 0 {
            // let the server see the hang-ups
            thread::sleep(Duration::from_millis(20));
        }
    }
}

#[test]
fn test_single_worker() {
    let addr = start_server(1);
    let mut first = Client::connect(addr).unwrap();
    let mut second = Client::connect(addr).unwrap();

    first.set(b"a", b"1").unwrap();
    second.set(b"b", b"2").unwrap();
    assert_eq!(&second.get(b"a").unwrap()[..], b"1");
    assert_eq!(&first.get(b"b").unwrap()[..], b"2");
}

#[test]
fn test_invalid_config_rejected() {
    let config = Config {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        threads: 0,
        ..Default::default()
    };
    assert!(matches!(Server::new(config), Err(Error::Config(_))));
}
