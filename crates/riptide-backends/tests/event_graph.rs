//! Cross-queue event graph behavior: user events gate kernels, markers
//! fence wait lists, and callbacks bridge host work back into the graph.

use riptide_backends::{ArgValue, Context, Device, Event, EventStatus, NdRange};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_user_event_bridges_host_work_between_queues() {
    let (ctx, device) = Context::with_cpu_device(false);
    let buffer = device.allocate_buffer(4 * 4).unwrap();

    // Host work runs in a callback on the marker; the follow-up kernel
    // on the main queue waits on the user event the callback completes.
    let host_done = Event::user();
    let host_ran = Arc::new(AtomicBool::new(false));

    let marker = ctx.queue().marker(&[]).unwrap();
    {
        let host_done = host_done.clone();
        let host_ran = host_ran.clone();
        let ctx = ctx.clone();
        marker.on_complete(move |_| {
            // Move data through the callback queue, OpenCL-style.
            let write = ctx
                .callback_queue()
                .enqueue_write(buffer, 0, vec![1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0], &[])
                .unwrap();
            write.wait().unwrap();
            host_ran.store(true, Ordering::SeqCst);
            host_done.complete();
        });
    }

    let mut kernel = ctx.compile_kernel("payload", "fill", ctx.build_options()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(buffer)).unwrap();
    kernel.set_arg(1, ArgValue::scalar(7u32)).unwrap();
    kernel.set_arg(2, ArgValue::scalar(2u32)).unwrap();
    let fill = ctx
        .queue()
        .enqueue_kernel(&kernel, NdRange::new(2, 2).unwrap(), &[host_done.clone()])
        .unwrap();

    fill.wait().unwrap();
    assert!(host_ran.load(Ordering::SeqCst), "kernel must not run before the host work");

    let mut out = [0u8; 16];
    device.read_buffer(buffer, 0, &mut out).unwrap();
    // First two elements stamped by the kernel, the rest by the callback.
    assert_eq!(out, [7, 0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);
    ctx.finish().unwrap();
}

#[test]
fn test_marker_fences_a_wait_list() {
    let (ctx, _device) = Context::with_cpu_device(false);

    let gates: Vec<Event> = (0..3).map(|_| Event::user()).collect();
    let fence = ctx.queue().marker(&gates).unwrap();

    std::thread::sleep(Duration::from_millis(10));
    assert!(!fence.status().is_terminal());

    for gate in &gates {
        gate.complete();
    }
    fence.wait().unwrap();
    assert_eq!(fence.status(), EventStatus::Complete);
    ctx.finish().unwrap();
}

#[test]
fn test_failed_user_event_poisons_the_chain() {
    let (ctx, _device) = Context::with_cpu_device(false);

    let gate = Event::user();
    let first = ctx.queue().marker(&[gate.clone()]).unwrap();
    let second = ctx.queue().marker(&[first.clone()]).unwrap();

    gate.fail(-5);
    assert!(first.wait().is_err());
    assert!(second.wait().is_err());
    // The queue latched the failure.
    assert!(ctx.finish().is_err());
}
