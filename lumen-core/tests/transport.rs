//! End-to-end transport tests: packetized frames travel over real UDP
//! sockets on localhost, every datagram is ACKed, and the receiver
//! pipeline reassembles them — all with a decode-free receiver so no
//! codec work happens.

use bytes::Bytes;
use lumen_core::clock::timestamp_us;
use lumen_core::datagram::{Datagram, FrameType};
use lumen_core::decoder::{Decoder, LazyLevel};
use lumen_core::encoder::SendQueue;
use lumen_core::message::{AckMsg, Msg};
use lumen_core::net::UdpLink;

// ── Helpers ──────────────────────────────────────────────────────

/// A connected (sender, receiver) socket pair on localhost.
fn link_pair() -> (UdpLink, UdpLink) {
    let sender = UdpLink::bind(0).unwrap();
    let port = sender.local_addr().unwrap().port();

    let receiver = UdpLink::connect(("127.0.0.1", port)).unwrap();
    sender.connect_peer(receiver.local_addr().unwrap()).unwrap();

    (sender, receiver)
}

/// Transmit every queued datagram, moving first transmissions into the
/// unacked map the way the sender's writability callback does.
fn flush_send_buf(queue: &mut SendQueue, sock: &UdpLink) {
    while let Some(mut datagram) = queue.send_buf().pop_front() {
        datagram.send_ts = timestamp_us();
        assert!(sock.send(&datagram.serialize()).unwrap());
        if datagram.num_rtx == 0 {
            queue.add_unacked(datagram).unwrap();
        }
    }
}

/// Receive one datagram, ACK it, and feed it to the decoder. Returns
/// the datagram's sequence number.
fn pump_one(receiver: &UdpLink, decoder: &mut Decoder) -> (u32, u16) {
    let data = receiver.recv().unwrap().unwrap();
    let datagram = Datagram::parse(&data).unwrap();
    let seq_num = datagram.seq_num();

    let ack = AckMsg::for_datagram(&datagram);
    assert!(receiver.send(&Msg::Ack(ack).serialize()).unwrap());

    decoder.add_datagram(datagram).unwrap();
    (seq_num.0, seq_num.1)
}

// ── Tests ────────────────────────────────────────────────────────

#[test]
fn frames_flow_end_to_end_and_acks_clear_unacked() {
    let (sender, receiver) = link_pair();

    let mut queue = SendQueue::default();
    let mut decoder = Decoder::new(64, 64, LazyLevel::NoDecodeDisplay, None).unwrap();

    // a key frame large enough to fragment, then a small delta frame
    let key_payload = Bytes::from(vec![0xC3; 5000]);
    let key_frags = Datagram::packetize(0, FrameType::Key, key_payload).unwrap();
    assert!(key_frags.len() > 1);
    let delta_frags =
        Datagram::packetize(1, FrameType::NonKey, Bytes::from(vec![0x5A; 300])).unwrap();

    let total = key_frags.len() + delta_frags.len();
    queue.send_buf().extend(key_frags);
    queue.send_buf().extend(delta_frags);
    flush_send_buf(&mut queue, &sender);
    assert_eq!(queue.unacked().len(), total);

    // receiver: reassemble and consume both frames
    for _ in 0..total {
        pump_one(&receiver, &mut decoder);
        while decoder.next_frame_complete() {
            decoder.consume_next_frame().unwrap();
        }
    }
    assert_eq!(decoder.next_frame(), 2);

    // sender: every ACK comes back and clears its unacked entry
    for _ in 0..total {
        let data = sender.recv().unwrap().unwrap();
        let Some(Msg::Ack(ack)) = Msg::parse(&data) else {
            panic!("expected an ACK");
        };
        queue.handle_ack(&ack, timestamp_us());
    }

    assert!(queue.unacked().is_empty());
    assert!(!queue.has_pending());
    assert!(queue.min_rtt_us().is_some());
    assert!(queue.ewma_rtt_us().is_some());
}

#[test]
fn lost_fragment_is_recovered_by_key_frame_skip_ahead() {
    let (sender, receiver) = link_pair();

    let mut queue = SendQueue::default();
    let mut decoder = Decoder::new(64, 64, LazyLevel::NoDecodeDisplay, None).unwrap();

    // frame 0 loses its first fragment in "the network"
    let mut frame0 =
        Datagram::packetize(0, FrameType::NonKey, Bytes::from(vec![0x11; 4000])).unwrap();
    frame0.remove(0);
    // frame 1 is a later key frame that arrives complete
    let frame1 = Datagram::packetize(1, FrameType::Key, Bytes::from(vec![0x22; 2000])).unwrap();

    let total = frame0.len() + frame1.len();
    queue.send_buf().extend(frame0);
    queue.send_buf().extend(frame1);
    flush_send_buf(&mut queue, &sender);

    for _ in 0..total {
        pump_one(&receiver, &mut decoder);
    }

    // frame 0 can never complete, but the key frame unblocks the
    // pipeline
    assert!(decoder.next_frame_complete());
    assert_eq!(decoder.next_frame(), 1);
    decoder.consume_next_frame().unwrap();
    assert_eq!(decoder.next_frame(), 2);
}

#[test]
fn duplicate_datagrams_on_the_wire_are_harmless() {
    let (sender, receiver) = link_pair();

    let mut decoder = Decoder::new(64, 64, LazyLevel::NoDecodeDisplay, None).unwrap();

    let frags = Datagram::packetize(0, FrameType::Key, Bytes::from(vec![0x7E; 100])).unwrap();
    let mut datagram = frags.into_iter().next().unwrap();
    datagram.send_ts = timestamp_us();

    // the same datagram arrives twice
    assert!(sender.send(&datagram.serialize()).unwrap());
    assert!(sender.send(&datagram.serialize()).unwrap());

    pump_one(&receiver, &mut decoder);
    pump_one(&receiver, &mut decoder);

    assert!(decoder.next_frame_complete());
    decoder.consume_next_frame().unwrap();
    assert_eq!(decoder.next_frame(), 1);
}
