//! End-to-end call correlation scenarios
//!
//! Each test drives the public pipeline the way the capture worker does:
//! synthetic frames through the dissector chain into storage.

use sipflow::capture::input::{CaptureInput, InputPoll, OfflineInput};
use sipflow::capture::output::{CaptureOutput, PcapFileOutput};
use sipflow::core::packet::{Packet, ProtoId};
use sipflow::dissect::{DissectConfig, DissectorChain};
use sipflow::storage::{CallGroup, CallState, Storage, StorageOptions};
use sipflow::testing;

fn feed(storage: &mut Storage, ts: u64, reverse: bool, text: &str) {
    let (src, dst) = if reverse {
        ("192.168.1.20", "192.168.1.10")
    } else {
        ("192.168.1.10", "192.168.1.20")
    };
    storage.append(testing::sip_packet(ts, src, 5060, dst, 5060, text));
}

#[test]
fn basic_invite_ok_ack_bye() {
    let mut storage = Storage::new(StorageOptions::default());

    feed(&mut storage, 1_000_000, false, &testing::sip_invite("abc@x", "alice", "bob", 1, None));
    assert_eq!(storage.call("abc@x").unwrap().state, CallState::Calling);

    feed(&mut storage, 2_000_000, true, &testing::sip_response(200, "OK", "abc@x", "alice", "bob", 1, "INVITE"));
    assert_eq!(storage.call("abc@x").unwrap().state, CallState::InCall);

    feed(&mut storage, 2_100_000, false, &testing::sip_request("ACK", "abc@x", "alice", "bob", 1, ""));
    feed(&mut storage, 8_000_000, false, &testing::sip_request("BYE", "abc@x", "alice", "bob", 2, ""));

    let call = storage.call("abc@x").unwrap();
    assert_eq!(call.state, CallState::SendBye);
    assert_eq!(call.msgcnt(), 4);
    // convdur = bye_ts - ok_ts
    assert_eq!(call.convdur_usec(), 6_000_000);

    let stats = storage.stats();
    assert_eq!((stats.total, stats.retained, stats.displayed), (1, 1, 1));
}

#[test]
fn retransmitted_invite_is_one_call() {
    let mut storage = Storage::new(StorageOptions::default());
    let invite = testing::sip_invite("retrans@x", "alice", "bob", 1, None);

    feed(&mut storage, 1_000_000, false, &invite);
    feed(&mut storage, 1_500_000, false, &invite);

    let call = storage.call("retrans@x").unwrap();
    assert_eq!(call.msgcnt(), 2);
    assert_eq!(call.state, CallState::Calling);
    assert_eq!(storage.stats().total, 1);
}

#[test]
fn attended_transfer_links_both_dialogs() {
    let mut storage = Storage::new(StorageOptions::default());

    feed(&mut storage, 1, false, &testing::sip_invite("dialog-a@pbx", "alice", "bob", 1, None));
    feed(&mut storage, 2, false, &testing::sip_invite("dialog-b@pbx", "bob", "carol", 1, None));
    feed(
        &mut storage,
        3,
        false,
        &testing::sip_request(
            "REFER", "dialog-a@pbx", "alice", "bob", 2,
            "Refer-To: <sip:carol@pbx?Replaces=dialog-b%40pbx%3Bto-tag%3D2%3Bfrom-tag%3D1>\r\n",
        ),
    );

    let a = storage.call("dialog-a@pbx").unwrap();
    let b = storage.call("dialog-b@pbx").unwrap();
    assert!(a.xcalls.contains("dialog-b@pbx"));
    assert!(b.xcalls.contains("dialog-a@pbx"));

    // extended flow rendering of A pulls in B's messages
    let mut group = CallGroup::new();
    group.add(a);
    group.anchor = Some("dialog-a@pbx".into());
    let merged = group.messages(&storage, true);
    assert_eq!(merged.len(), 3);
    let ts: Vec<u64> = merged.iter().map(|m| m.ts_usec()).collect();
    assert_eq!(ts, [1, 2, 3]);
}

#[test]
fn sdp_media_extraction() {
    let mut storage = Storage::new(StorageOptions::default());
    let sdp = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\n";
    feed(&mut storage, 1, false, &testing::sip_invite("sdp@x", "alice", "bob", 1, Some(sdp)));

    let call = storage.call("sdp@x").unwrap();
    let medias = call.messages()[0].medias();
    assert_eq!(medias.len(), 1);
    assert_eq!(medias[0].mtype.to_string(), "audio");
    assert_eq!(medias[0].rtp_port, 4000);
    assert_eq!(medias[0].formats.len(), 2);
    assert_eq!(medias[0].first_format(), Some("PCMU/8000"));
}

#[test]
fn memory_cap_keeps_newest_terminated() {
    let mut storage = Storage::new(StorageOptions {
        memory_limit: 8 * 1024,
        ..Default::default()
    });

    for i in 0..100u64 {
        let cid = format!("dlg-{:03}@x", i);
        feed(&mut storage, i * 100, false, &testing::sip_invite(&cid, "alice", "bob", 1, None));
        feed(&mut storage, i * 100 + 50, false, &testing::sip_request("BYE", &cid, "alice", "bob", 2, ""));
    }

    let stats = storage.stats();
    assert_eq!(stats.total, 100);
    assert!(stats.retained < 100 && stats.retained > 0);
    assert!(stats.mem_bytes <= 8 * 1024);

    // the oldest by first-timestamp were evicted, the newest survive
    let retained: Vec<&str> = storage.calls().map(|c| c.call_id.as_str()).collect();
    assert!(retained.contains(&"dlg-099@x"));
    assert!(!retained.contains(&"dlg-000@x"));
    let oldest_retained: u64 = 100 - stats.retained as u64;
    assert!(storage
        .calls()
        .all(|c| c.call_id >= format!("dlg-{:03}@x", oldest_retained)));
}

#[test]
fn pause_drops_ingress() {
    let mut storage = Storage::new(StorageOptions::default());

    storage.set_paused(true);
    for i in 0..10u64 {
        let cid = format!("paused-{}@x", i);
        feed(&mut storage, i, false, &testing::sip_invite(&cid, "alice", "bob", 1, None));
    }
    storage.set_paused(false);
    feed(&mut storage, 100, false, &testing::sip_invite("live@x", "alice", "bob", 1, None));

    let stats = storage.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.retained, 1);
    assert!(storage.call("live@x").is_some());
}

/// Writing retained packets to a capture file and re-reading them yields the
/// same call table.
#[test]
fn pcap_roundtrip_preserves_call_table() {
    let mut storage = Storage::new(StorageOptions::default());

    feed(&mut storage, 1_000_000, false, &testing::sip_invite("rt-1@x", "alice", "bob", 1, None));
    feed(&mut storage, 2_000_000, true, &testing::sip_response(200, "OK", "rt-1@x", "alice", "bob", 1, "INVITE"));
    feed(&mut storage, 3_000_000, false, &testing::sip_request("BYE", "rt-1@x", "alice", "bob", 2, ""));
    feed(&mut storage, 4_000_000, false, &testing::sip_invite("rt-2@x", "carol", "dave", 1, None));

    // write every retained packet
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.pcap");
    let path = path.to_str().unwrap();
    {
        let mut output = PcapFileOutput::create(path, 1).unwrap();
        for packet in storage.export_packets() {
            output.write(packet);
        }
        output.close();
    }

    // re-read through the offline input and a fresh chain
    let mut reread = Storage::new(StorageOptions::default());
    let mut chain = DissectorChain::new(DissectConfig::default());
    let mut input = OfflineInput::open(path).unwrap();
    loop {
        match input.poll().unwrap() {
            InputPoll::Frame(frame) => {
                let mut packet = Packet::new(frame.ts_usec, frame.link_type, frame.data);
                let extras = chain.dissect(&mut packet, ProtoId::Link);
                reread.append(packet);
                for extra in extras {
                    reread.append(extra);
                }
            }
            InputPoll::Finished => break,
            InputPoll::Timeout => {}
        }
    }

    assert_eq!(reread.stats().retained, storage.stats().retained);
    for call in storage.calls() {
        let other = reread.call(&call.call_id).expect("call survives roundtrip");
        assert_eq!(other.msgcnt(), call.msgcnt());
        assert_eq!(other.state, call.state);
        assert_eq!(other.first_ts, call.first_ts);
        assert_eq!(other.last_ts, call.last_ts);
    }
}

/// Feeding the same stream twice yields the same call set keyed by Call-ID.
#[test]
fn refeed_is_idempotent_per_callid() {
    let stream: Vec<(u64, bool, String)> = vec![
        (1, false, testing::sip_invite("idem-1@x", "alice", "bob", 1, None)),
        (2, true, testing::sip_response(180, "Ringing", "idem-1@x", "alice", "bob", 1, "INVITE")),
        (3, false, testing::sip_invite("idem-2@x", "carol", "dave", 1, None)),
    ];

    let mut once = Storage::new(StorageOptions::default());
    for (ts, rev, text) in &stream {
        feed(&mut once, *ts, *rev, text);
    }

    let mut twice = Storage::new(StorageOptions::default());
    for (ts, rev, text) in stream.iter().chain(stream.iter()) {
        feed(&mut twice, *ts, *rev, text);
    }

    assert_eq!(once.stats().retained, twice.stats().retained);
    for call in once.calls() {
        let other = twice.call(&call.call_id).unwrap();
        assert_eq!(other.state, call.state);
    }
}
