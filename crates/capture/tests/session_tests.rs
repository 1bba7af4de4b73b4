//! Session lifecycle tests against the in-process device
//!
//! Run with: `cargo test -p capture --test session_tests`

use capture::capture::{CaptureSession, CapturedFrame, SessionError, SessionParams, SessionState};
use capture::usb::mock::MockUsbFs;
use capture::usb::{RegisterWriteError, TransportError};
use common::test_utils::{DEFAULT_TEST_TIMEOUT, field_packets, field_payload, iso_packets, wait_until};
use nix::errno::Errno;
use protocol::registers::{
    COMPOSITE_INPUT, NTSC_TV_NORM, PAL_TV_NORM, REGISTER_REQUEST_TYPE, SVIDEO_INPUT, USBTV_REQUEST_REG,
    VIDEO_INIT,
};
use protocol::{FrameState, ScanType, TvInput, TvNorm};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

const VIDEO_EP: u8 = 0x81;

fn session(params: SessionParams) -> (CaptureSession, Arc<MockUsbFs>, Receiver<CapturedFrame>) {
    let mock = Arc::new(MockUsbFs::new());
    let (tx, rx) = mpsc::channel();
    let consumer = move |frame: CapturedFrame| {
        let _ = tx.send(frame);
    };
    let session = CaptureSession::new(mock.clone(), params, consumer);
    (session, mock, rx)
}

/// Deliver protocol packets through the iso URBs, 3 per iso packet, 8 per URB
fn stream(mock: &MockUsbFs, packets: &[Vec<u8>]) {
    for urb in iso_packets(packets, 3).chunks(8) {
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.in_flight_on(VIDEO_EP) > 0));
        assert!(mock.complete_iso(VIDEO_EP, urb));
    }
}

fn register_controls(mock: &MockUsbFs) -> Vec<(u16, u16)> {
    mock.controls()
        .iter()
        .map(|setup| {
            assert_eq!(setup.request_type, REGISTER_REQUEST_TYPE);
            assert_eq!(setup.request, USBTV_REQUEST_REG);
            (setup.index, setup.value)
        })
        .collect()
}

// ============================================================================
// Start and Stop
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_start_programs_device_and_queues_urbs() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let expected: Vec<(u16, u16)> = [VIDEO_INIT, NTSC_TV_NORM, COMPOSITE_INPUT].concat();
        assert_eq!(register_controls(&mock), expected);
        assert_eq!(mock.interface_settings(), vec![(0, 0), (0, 1)]);
        assert_eq!(mock.in_flight_on(VIDEO_EP), 16);

        let geometry = session.geometry().unwrap();
        assert_eq!(geometry.packets_per_field, 360);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (mut session, _mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        assert!(matches!(
            session.start(),
            Err(SessionError::InvalidState {
                expected: SessionState::Idle,
                actual: SessionState::Streaming,
            })
        ));
    }

    #[test]
    fn test_stop_releases_everything() {
        let (mut session, mock, rx) = session(SessionParams::default());
        session.start().unwrap();
        stream(&mock, &field_packets(1, true, 360));
        let frame = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
        drop(frame);

        let summary = session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(summary.frames_emitted, 1);
        assert_eq!(summary.locked_slots, 0);
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.interface_settings().last(), Some(&(0, 0)));
        assert!(session.geometry().is_none());
        assert!(session.stop().is_none());
    }

    #[test]
    fn test_restart_after_stop() {
        let (mut session, mock, rx) = session(SessionParams::default());
        session.start().unwrap();
        session.stop().unwrap();
        session.start().unwrap();

        stream(&mock, &field_packets(2, true, 360));
        let frame = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
        assert_eq!(frame.frame_id(), 2);
        // counters start over with every session
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.stats().frames_emitted() == 1));
    }
}

// ============================================================================
// Frame Delivery
// ============================================================================

mod frames {
    use super::*;

    #[test]
    fn test_field_arrives_at_consumer() {
        let (mut session, mock, rx) = session(SessionParams::default());
        session.start().unwrap();
        stream(&mock, &field_packets(7, true, 360));

        let frame = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
        assert_eq!(frame.state(), FrameState::Complete);
        assert_eq!((frame.width(), frame.height()), (720, 240));
        assert_eq!(frame.data(), field_payload(7, true, 360).as_slice());
    }

    #[test]
    fn test_partial_field_is_delivered_and_counted() {
        let (mut session, mock, rx) = session(SessionParams::default());
        session.start().unwrap();
        let mut packets = field_packets(7, true, 360);
        packets.remove(100);
        stream(&mock, &packets);

        let frame = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
        assert_eq!(frame.state(), FrameState::Partial);
        assert_eq!(session.stats().incomplete_frames(), 1);
    }

    #[test]
    fn test_panicking_consumer_does_not_stop_capture() {
        let mock = Arc::new(MockUsbFs::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = move |frame: CapturedFrame| {
            sink.lock().unwrap().push(frame.frame_id());
            if frame.frame_id() == 1 {
                panic!("consumer failure");
            }
        };
        let mut session = CaptureSession::new(mock.clone(), SessionParams::default(), consumer);
        session.start().unwrap();

        stream(&mock, &field_packets(1, true, 360));
        stream(&mock, &field_packets(2, true, 360));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || seen.lock().unwrap().len() == 2));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(session.stop().unwrap().locked_slots, 0);
    }
}

// ============================================================================
// Reconfiguration
// ============================================================================

mod reconfigure {
    use super::*;

    #[test]
    fn test_norm_change_while_streaming_restarts() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        session.set_tv_norm(TvNorm::Pal).unwrap();

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.params().norm, TvNorm::Pal);
        assert_eq!(session.geometry().unwrap().packets_per_field, 432);

        let controls = register_controls(&mock);
        let second_start = VIDEO_INIT.len() + NTSC_TV_NORM.len() + COMPOSITE_INPUT.len();
        let expected: Vec<(u16, u16)> = [VIDEO_INIT, PAL_TV_NORM, COMPOSITE_INPUT].concat();
        assert_eq!(controls[second_start..], expected[..]);
        assert_eq!(mock.in_flight_on(VIDEO_EP), 16);
    }

    #[test]
    fn test_input_change_uses_stop_then_start() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        session.set_input(TvInput::Svideo).unwrap();

        let controls = register_controls(&mock);
        assert!(controls.ends_with(SVIDEO_INPUT));
        assert_eq!(mock.interface_settings(), vec![(0, 0), (0, 1), (0, 0), (0, 0), (0, 1)]);
    }

    #[test]
    fn test_changes_while_idle_only_store() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        session.set_scan_type(ScanType::Interleaved).unwrap();
        session.set_frame_pool_size(6).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(mock.controls().is_empty());

        session.start().unwrap();
        let geometry = session.geometry().unwrap();
        assert_eq!(geometry.scan, ScanType::Interleaved);
        assert_eq!(geometry.picture_height, 480);
    }

    #[test]
    fn test_repeated_reconfiguration_leaks_no_slots() {
        let (mut session, mock, rx) = session(SessionParams::default());
        session.start().unwrap();
        for size in [2, 5, 3] {
            stream(&mock, &field_packets(size as u8, true, 360));
            let _frame = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
            // the consumer still holds a frame across the restart
            session.set_frame_pool_size(size).unwrap();
            assert_eq!(session.locked_slots(), Some(1));
        }
        assert_eq!(session.stop().unwrap().locked_slots, 0);
    }

    #[test]
    fn test_invalid_pool_size_is_rejected_up_front() {
        let (mut session, _mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        assert!(matches!(
            session.set_frame_pool_size(1),
            Err(SessionError::InvalidParams(_))
        ));
        assert_eq!(session.state(), SessionState::Streaming);
    }
}

// ============================================================================
// Failures
// ============================================================================

mod failures {
    use super::*;

    #[test]
    fn test_register_failure_reports_index_and_unwinds() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        mock.fail_nth_control(3, Errno::EPIPE);

        let RegisterWriteError { index, value, errno } = match session.start() {
            Err(SessionError::Register(e)) => e,
            other => panic!("unexpected result: {:?}", other),
        };
        assert_eq!((index, value), VIDEO_INIT[3]);
        assert_eq!(errno, Errno::EPIPE);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(mock.in_flight(), 0);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_iso_submit_failure_unwinds() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        mock.fail_nth_submit(5, Errno::ENOMEM);

        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::Submit(Errno::ENOMEM))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.interface_settings().last(), Some(&(0, 0)));

        // the consumer survived the failed start
        session.start().unwrap();
        assert_eq!(mock.in_flight_on(VIDEO_EP), 16);
    }

    #[test]
    fn test_invalid_params_fail_before_touching_device() {
        let params = SessionParams {
            max_packet_size: 1000,
            ..Default::default()
        };
        let (mut session, mock, _rx) = session(params);
        assert!(matches!(session.start(), Err(SessionError::InvalidParams(_))));
        assert!(mock.interface_settings().is_empty());
    }

    #[test]
    fn test_device_loss_is_reported_and_stop_cleans_up() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        mock.disconnect();

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.is_device_lost()));
        let summary = session.stop().unwrap();
        assert_eq!(summary.locked_slots, 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_polling_tears_down_after_device_loss() {
        let (mut session, mock, _rx) = session(SessionParams::default());
        session.start().unwrap();
        assert!(session.is_streaming());
        assert!(session.poll_device().is_none());

        mock.disconnect();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !session.is_streaming()));
        // nothing is torn down until the owner polls
        assert_eq!(session.state(), SessionState::Streaming);

        let summary = session.poll_device().unwrap();
        assert_eq!(summary.locked_slots, 0);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.poll_device().is_none());
        assert!(session.stop().is_none());
    }
}
