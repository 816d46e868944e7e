//! Resource exhaustion and non-responsive peer scenarios.

mod common;

use common::{default_test_config, TestBed};
use gprs_core::Direction;
use gprs_mac::resources::{USF_MAX, USF_MIN};
use gprs_mac::tbf::{StopCause, TbfState};

/// Six MSs hold every USF on the channel; a seventh uplink request must
/// keep retrying without corrupting any existing holder, and may only
/// proceed once a freed USF leaves its quarantine.
#[test]
fn test_usf_exhaustion_and_quarantine() {
    let mut bed = TestBed::new(default_test_config());
    bed.tick();
    assert_eq!(bed.mac.chan_order.len(), 1);
    let chan = bed.mac.chan_order[0];

    for i in 0..6u32 {
        bed.establish_uplink_request(0x8000_0100 + i, 50);
    }
    bed.take_tx();
    bed.take_agch();

    // All six attached and hold distinct USFs.
    let now = bed.now();
    let mut holders = Vec::new();
    for usf in USF_MIN..=USF_MAX {
        let holder = bed.mac.channels.get_mut(chan).unwrap().usfs.holder(usf, now);
        assert!(holder.is_some(), "usf {} should be held", usf);
        assert!(!holders.contains(&holder), "usf {} holder duplicated", usf);
        holders.push(holder);
    }

    // The seventh request gets a TBF that cannot collect its resources.
    bed.establish_uplink_request(0x8000_0200, 50);
    let seventh = bed
        .mac
        .tbfs
        .iter()
        .find(|(_, t)| t.core.tlli == 0x8000_0200)
        .map(|(id, _)| id)
        .expect("seventh TBF missing");
    assert_eq!(bed.mac.tbfs.get(seventh).unwrap().core.state(), TbfState::DataReadyToConnect);

    // It retries every tick without disturbing the holders.
    bed.tick_n(20);
    assert_eq!(bed.mac.tbfs.get(seventh).unwrap().core.state(), TbfState::DataReadyToConnect);
    let now = bed.now();
    for (i, usf) in (USF_MIN..=USF_MAX).enumerate() {
        assert_eq!(bed.mac.channels.get_mut(chan).unwrap().usfs.holder(usf, now), holders[i]);
    }

    // Kill one session; its USF is quarantined, not immediately free.
    let victim = bed
        .mac
        .tbfs
        .iter()
        .find(|(_, t)| t.core.tlli == 0x8000_0100)
        .map(|(id, _)| id)
        .unwrap();
    assert!(bed.mac.force_cancel_tbf(victim));
    assert_eq!(bed.mac.tbfs.get(victim).unwrap().core.state(), TbfState::Dead);

    bed.tick_n(20);
    assert_eq!(
        bed.mac.tbfs.get(seventh).unwrap().core.state(),
        TbfState::DataReadyToConnect,
        "quarantined USF must not be handed to a different MS"
    );

    // After the 5 second quarantine the seventh can finally attach.
    bed.tick_n(260);
    let state = bed.mac.tbfs.get(seventh).unwrap().core.state();
    assert_ne!(state, TbfState::DataReadyToConnect, "seventh TBF never got its USF");
    assert_ne!(state, TbfState::Dead);
}

/// A downlink TBF whose RRBP polls go unanswered must be cancelled by the
/// miss counter, and its TFI only becomes reusable after the quarantine.
#[test]
fn test_nonresponsive_downlink_ms() {
    let mut cfg = default_test_config();
    cfg.downlink.retry_coding = 0; // no retry; watch one TBF die
    cfg.timers.nonresponsive = 0; // let the miss counter do the work
    let mut bed = TestBed::new(cfg);
    bed.tick();

    let tlli = 0xc000_0099;
    bed.handle.enqueue_downlink_pdu(tlli, vec![0x55; 400], "doomed");
    bed.tick_n(3);

    // Assignment went to CCCH; pretend the MS acked it so the transfer
    // starts, then never answer anything again.
    let agch = bed.take_agch();
    let tfi = agch
        .iter()
        .find_map(|m| match m {
            gprs_msgs::DlMsg::DownlinkAssignment(d) => Some(d.tfi),
            _ => None,
        })
        .expect("no downlink assignment");
    let ms = bed.mac.mss.iter().next().unwrap().1;
    let pacch = ms.pacch.unwrap();
    let (arfcn, tn) = bed.chan_pos(pacch);
    let res_bsn = bed
        .mac
        .channels
        .get(pacch)
        .unwrap()
        .reservations
        .iter()
        .find(|r| r.kind == gprs_mac::resources::ResKind::Poll)
        .map(|r| r.bsn)
        .unwrap();
    while bed.now().is_before(res_bsn) {
        bed.tick();
    }
    bed.send_control_ack(arfcn, tn, res_bsn, tlli);
    bed.tick();

    let tbf_id = bed.mac.tbfs.iter().next().unwrap().0;
    assert_eq!(bed.mac.tbfs.get(tbf_id).unwrap().core.state(), TbfState::DataTransmit);

    // Silence. The unanswered RRBP polls push N3105 over its limit.
    let mut released = false;
    for _ in 0..2000 {
        bed.tick();
        let state = bed.mac.tbfs.get(tbf_id).map(|t| t.core.state());
        if state == Some(TbfState::TbfRelease) && !released {
            released = true;
            assert_eq!(bed.mac.tbfs.get(tbf_id).unwrap().core.cause, Some(StopCause::N3105));
        }
        if state == Some(TbfState::Dead) {
            break;
        }
    }
    assert!(released, "TBF never entered the release procedure");
    assert_eq!(bed.mac.tbfs.get(tbf_id).unwrap().core.state(), TbfState::Dead);

    // Dead but not gone: the TFI stays off the market through quarantine.
    assert_eq!(bed.mac.tfis.get(Direction::Down, tfi), Some(tbf_id));
    bed.tick_n(260);
    assert!(bed.mac.tfis.get(Direction::Down, tfi).is_none(), "TFI not released after quarantine");
    assert!(bed.mac.tbfs.get(tbf_id).is_none(), "dead TBF not cleaned up after quarantine");
}

/// Six concurrent uplink sessions share the channel: distinct TFIs,
/// distinct USFs, grants rotated fairly, nobody starved or killed.
#[test]
fn test_six_concurrent_sessions() {
    let mut cfg = default_test_config();
    // The simulated MSs never answer their grants; keep the miss counter
    // out of the picture, this test is about resource sharing.
    cfg.counters.n3101_max = 100_000;
    let mut bed = TestBed::new(cfg);
    bed.tick();

    let mut tfis = Vec::new();
    let mut usfs = Vec::new();
    for i in 0..6u32 {
        let (_, _, tfi, usf) = bed.establish_uplink_session(0x8000_0300 + i, 500);
        assert!(!tfis.contains(&tfi), "TFI {} issued twice", tfi);
        assert!(!usfs.contains(&usf), "USF {} issued twice", usf);
        tfis.push(tfi);
        usfs.push(usf);
    }

    bed.take_tx();
    bed.tick_n(30);

    // All six alive and transmitting.
    let live = bed
        .mac
        .tbfs
        .iter()
        .filter(|(_, t)| t.core.state() == TbfState::DataTransmit)
        .count();
    assert_eq!(live, 6);

    // Every session got USF grants within the window (fairness).
    let tx = bed.take_tx();
    for usf in &usfs {
        assert!(tx.iter().any(|r| r.flags.usf == *usf), "USF {} never granted", usf);
    }
}
