//! Integration tests for the URB transport against the in-process device
//!
//! Run with: `cargo test -p capture --test transport_tests`

use capture::usb::mock::MockUsbFs;
use capture::usb::usbfs::{URB_BULK_CONTINUATION, URB_ISO_ASAP, URB_SHORT_NOT_OK, URB_TYPE_BULK, URB_TYPE_ISO};
use capture::usb::{BulkCompletion, IsoConfig, TransferControl, TransportError, UrbTransport};
use common::CaptureStats;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until};
use nix::errno::Errno;
use std::sync::{Arc, Mutex};

const ISO_EP: u8 = 0x81;
const BULK_EP: u8 = 0x82;

fn transport() -> (UrbTransport, Arc<MockUsbFs>) {
    let mock = Arc::new(MockUsbFs::new());
    let transport = UrbTransport::new(mock.clone(), Arc::new(CaptureStats::new()));
    (transport, mock)
}

fn iso_config(count: usize) -> IsoConfig {
    IsoConfig {
        count,
        endpoint: ISO_EP,
        packet_size: 3072,
        packets_per_transfer: 8,
    }
}

type BulkLog = Arc<Mutex<Vec<(Result<usize, i32>, Vec<u8>)>>>;

fn bulk_logger(
    control: TransferControl,
) -> (BulkLog, impl FnMut(&BulkCompletion<'_>) -> TransferControl + Send + 'static) {
    let log: BulkLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callback = move |c: &BulkCompletion<'_>| {
        sink.lock().unwrap().push((c.result, c.data.to_vec()));
        control
    };
    (log, callback)
}

// ============================================================================
// Isochronous Streaming
// ============================================================================

mod isochronous {
    use super::*;

    #[test]
    fn test_completion_delivers_packets_and_resubmits() {
        let (mut transport, mock) = transport();
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport
            .init_isochronous(iso_config(2), move |transfer| {
                let mut sink = sink.lock().unwrap();
                for packet in transfer.packets() {
                    sink.push(packet.data.to_vec());
                }
            })
            .unwrap();
        transport.start_async_reap().unwrap();

        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 2);
        assert!(submissions.iter().all(|s| s.urb_type == URB_TYPE_ISO
            && s.flags == URB_ISO_ASAP
            && s.length == 8 * 3072));

        assert!(mock.complete_iso(ISO_EP, &[vec![1u8; 3072], vec![2u8; 100]]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.submissions().len() == 3));
        assert_eq!(mock.in_flight_on(ISO_EP), 2);

        let seen = seen.lock().unwrap();
        // 8 descriptors per URB; unfilled ones arrive empty
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[0], vec![1u8; 3072]);
        assert_eq!(seen[1], vec![2u8; 100]);
        assert!(seen[2..].iter().all(Vec::is_empty));
        assert_eq!(transport.stats().snapshot().bytes_received, 3172);
    }

    #[test]
    fn test_stall_clears_halt_and_keeps_streaming() {
        let (mut transport, mock) = transport();
        transport.init_isochronous(iso_config(2), |_| {}).unwrap();
        transport.start_async_reap().unwrap();

        assert!(mock.fail_next(ISO_EP, -(Errno::EPIPE as i32)));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.cleared_halts() == vec![ISO_EP]));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.in_flight_on(ISO_EP) == 2));
        assert_eq!(transport.stats().snapshot().stalls_cleared, 1);
        assert!(transport.is_running());
    }

    #[test]
    fn test_transient_error_is_counted_and_resubmitted() {
        let (mut transport, mock) = transport();
        transport.init_isochronous(iso_config(1), |_| {}).unwrap();
        transport.start_async_reap().unwrap();

        assert!(mock.fail_next(ISO_EP, -(Errno::EPROTO as i32)));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.in_flight_on(ISO_EP) == 1));
        assert_eq!(transport.stats().snapshot().transient_errors, 1);
        assert!(!transport.is_stopped());
    }

    #[test]
    fn test_partial_submit_failure_unwinds() {
        let (transport, mock) = transport();
        mock.fail_nth_submit(3, Errno::ENOMEM);
        let result = transport.init_isochronous(iso_config(8), |_| {});
        assert!(matches!(result, Err(TransportError::Submit(Errno::ENOMEM))));
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(transport.in_flight(), 0);

        // a clean retry works
        transport.init_isochronous(iso_config(8), |_| {}).unwrap();
        assert_eq!(mock.in_flight_on(ISO_EP), 8);
    }

    #[test]
    fn test_stop_cancels_everything() {
        let (mut transport, mock) = transport();
        transport.init_isochronous(iso_config(4), |_| {}).unwrap();
        transport.start_async_reap().unwrap();
        assert_eq!(transport.in_flight(), 4);

        transport.stop_async_reap();
        assert!(!transport.is_running());
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(transport.in_flight(), 0);
        // nothing was resubmitted while stopping
        assert_eq!(mock.submissions().len(), 4);
    }

    #[test]
    fn test_callback_is_dropped_by_free_all() {
        struct Flag(Arc<Mutex<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                *self.0.lock().unwrap() = true;
            }
        }

        let (mut transport, _mock) = transport();
        let dropped = Arc::new(Mutex::new(false));
        let flag = Flag(dropped.clone());
        transport
            .init_isochronous(iso_config(1), move |_| {
                let _ = &flag;
            })
            .unwrap();
        transport.free_all();
        assert!(*dropped.lock().unwrap());
    }
}

// ============================================================================
// Bulk Transfers and Continuation Groups
// ============================================================================

mod bulk {
    use super::*;

    #[test]
    fn test_large_transfer_is_chained() {
        let (mut transport, mock) = transport();
        transport.start_async_reap().unwrap();
        let (log, callback) = bulk_logger(TransferControl::Stop);
        transport.submit_bulk(BULK_EP, 40000, callback).unwrap();

        let submissions = mock.submissions();
        let shape: Vec<(usize, u32)> = submissions.iter().map(|s| (s.length, s.flags)).collect();
        assert_eq!(
            shape,
            vec![
                (16384, URB_SHORT_NOT_OK),
                (16384, URB_BULK_CONTINUATION | URB_SHORT_NOT_OK),
                (7232, URB_BULK_CONTINUATION),
            ]
        );
        assert!(submissions.iter().all(|s| s.urb_type == URB_TYPE_BULK));

        assert!(mock.complete_bulk(BULK_EP, &[1u8; 16384], 0));
        assert!(mock.complete_bulk(BULK_EP, &[2u8; 16384], 0));
        assert!(mock.complete_bulk(BULK_EP, &[3u8; 7232], 0));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || log.lock().unwrap().len() == 1));

        let log = log.lock().unwrap();
        let (result, data) = &log[0];
        assert_eq!(*result, Ok(40000));
        assert_eq!(data.len(), 40000);
        assert_eq!(data[0], 1);
        assert_eq!(data[16384], 2);
        assert_eq!(data[39999], 3);
        // Stop: not resubmitted
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || transport.in_flight() == 0));
        assert_eq!(mock.submissions().len(), 3);
    }

    #[test]
    fn test_member_error_reports_once_then_resubmits_group() {
        let (mut transport, mock) = transport();
        transport.start_async_reap().unwrap();
        let (log, callback) = bulk_logger(TransferControl::Continue);
        transport.submit_bulk(BULK_EP, 40000, callback).unwrap();

        let eproto = -(Errno::EPROTO as i32);
        assert!(mock.fail_next(BULK_EP, eproto));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.submissions().len() == 6));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.in_flight_on(BULK_EP) == 3));

        {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].0, Err(eproto));
            assert!(log[0].1.is_empty());
        }

        let flags: Vec<u32> = mock.submissions().iter().map(|s| s.flags).collect();
        assert_eq!(flags[..3], flags[3..]);
    }

    #[test]
    fn test_short_member_completes_group_early() {
        let (mut transport, mock) = transport();
        transport.start_async_reap().unwrap();
        let (log, callback) = bulk_logger(TransferControl::Stop);
        transport.submit_bulk(BULK_EP, 40000, callback).unwrap();

        assert!(mock.complete_bulk(BULK_EP, &[7u8; 500], -(Errno::EREMOTEIO as i32)));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || log.lock().unwrap().len() == 1));
        let log = log.lock().unwrap();
        assert_eq!(log[0].0, Ok(500));
        assert_eq!(log[0].1, vec![7u8; 500]);
    }

    #[test]
    fn test_single_urb_transfer_reports_errors() {
        let (mut transport, mock) = transport();
        transport.start_async_reap().unwrap();
        let (log, callback) = bulk_logger(TransferControl::Stop);
        transport.submit_bulk(BULK_EP, 512, callback).unwrap();
        assert_eq!(mock.submissions()[0].flags, 0);

        assert!(mock.fail_next(BULK_EP, -(Errno::EPROTO as i32)));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || log.lock().unwrap().len() == 1));
        assert_eq!(log.lock().unwrap()[0].0, Err(-(Errno::EPROTO as i32)));
    }

    #[test]
    fn test_kill_frees_without_callback() {
        let (mut transport, mock) = transport();
        transport.start_async_reap().unwrap();
        let (log, callback) = bulk_logger(TransferControl::Continue);
        let id = transport.submit_bulk(BULK_EP, 40000, callback).unwrap();

        transport.kill_transfer(id).unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || transport.in_flight() == 0));
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.submissions().len(), 3);
        assert!(log.lock().unwrap().is_empty());
        assert!(matches!(
            transport.kill_transfer(id),
            Err(TransportError::UnknownTransfer(_))
        ));
    }

    #[test]
    fn test_failed_resubmit_is_reported_to_owner() {
        let (mut transport, mock) = transport();
        transport.start_async_reap().unwrap();
        let (log, callback) = bulk_logger(TransferControl::Continue);
        let id = transport.submit_bulk(BULK_EP, 40000, callback).unwrap();

        // the first member of the next round is refused
        mock.fail_nth_submit(0, Errno::ENOMEM);
        assert!(mock.complete_bulk(BULK_EP, &[1u8; 16384], 0));
        assert!(mock.complete_bulk(BULK_EP, &[2u8; 16384], 0));
        assert!(mock.complete_bulk(BULK_EP, &[3u8; 7232], 0));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || log.lock().unwrap().len() == 2));

        {
            let log = log.lock().unwrap();
            assert_eq!(log[0].0, Ok(40000));
            assert_eq!(log[1].0, Err(-(Errno::ENOMEM as i32)));
            assert!(log[1].1.is_empty());
        }
        assert_eq!(transport.stats().snapshot().resubmit_failures, 1);
        assert_eq!(mock.in_flight(), 0);
        assert!(matches!(
            transport.kill_transfer(id),
            Err(TransportError::UnknownTransfer(_))
        ));
    }

    #[test]
    fn test_submit_failure_unwinds_group() {
        let (transport, mock) = transport();
        mock.fail_nth_submit(1, Errno::ENOMEM);
        let (_log, callback) = bulk_logger(TransferControl::Continue);
        let result = transport.submit_bulk(BULK_EP, 40000, callback);
        assert!(matches!(result, Err(TransportError::Submit(Errno::ENOMEM))));
        // the first member was cancelled and is waiting to be reaped
        assert_eq!(mock.in_flight(), 0);
    }
}

// ============================================================================
// Device Loss
// ============================================================================

mod device_loss {
    use super::*;

    #[test]
    fn test_disconnect_stops_transport() {
        let (mut transport, mock) = transport();
        transport.init_isochronous(iso_config(4), |_| {}).unwrap();
        let (log, callback) = bulk_logger(TransferControl::Continue);
        transport.submit_bulk(BULK_EP, 1024, callback).unwrap();
        transport.start_async_reap().unwrap();

        mock.disconnect();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || transport.is_stopped()));
        assert!(!transport.is_running());

        // the bulk owner hears about it exactly once
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || log.lock().unwrap().len() == 1));
        assert_eq!(log.lock().unwrap()[0].0, Err(-(Errno::ENODEV as i32)));

        assert!(matches!(
            transport.init_isochronous(iso_config(1), |_| {}),
            Err(TransportError::Stopped)
        ));
        assert!(matches!(transport.start_async_reap(), Err(TransportError::Stopped)));

        transport.free_all();
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
