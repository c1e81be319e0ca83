//! Pipeline-level behavior: event chaining between tools, the `once`
//! flag, and assertion fatality.

use riptide_backends::{Device, Event};
use riptide_core::tools::{Reduction, ScalarExpression, Set};
use riptide_core::{CalcServer, Error, Pipeline, ScalarValue, Settings, Tool};
use std::time::Duration;

fn upload_f32(device: &riptide_backends::CpuDevice, buffer: riptide_backends::BufferHandle, values: &[f32]) {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    device.write_buffer(buffer, 0, &bytes).unwrap();
}

/// A reader's device work must sit behind the writer's event: gating the
/// input variable on a user event stalls the downstream reduction until
/// the event completes.
#[test]
fn test_event_chain_orders_writer_before_reader() {
    riptide_tracing::init_from_env();
    let (server, device) = CalcServer::new(&Settings::default());
    let vars = server.variables();
    vars.register("N", "unsigned int", "", "4").unwrap();
    vars.register("a", "float*", "N", "").unwrap();
    vars.register("sum", "float", "", "0").unwrap();

    let a = vars.require("a").unwrap();
    upload_f32(&device, a.buffer().unwrap(), &[1.0, 2.0, 3.0, 4.0]);

    // Pose as an upstream writer that has not finished yet.
    let gate = Event::user();
    a.set_writing_event(gate.clone());

    let mut reduction = Reduction::new("sum a", "a", "sum", "c = a + b;", "0");
    reduction.setup(&server).unwrap();

    let worker = {
        let server = server.clone();
        std::thread::spawn(move || {
            riptide_core::execute(&mut reduction, &server).unwrap();
            server.finish().unwrap();
        })
    };

    // The reduction blocks on its final read; the result must not appear
    // while the writer is still pending.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        vars.require("sum").unwrap().scalar().unwrap(),
        ScalarValue::Float(0.0),
        "reduction must not complete before its input's writing event"
    );

    gate.complete();
    worker.join().unwrap();
    assert_eq!(vars.require("sum").unwrap().scalar().unwrap(), ScalarValue::Float(10.0));
}

/// After a tool runs, its out-event is registered as a reader on the
/// inputs, so a subsequent writer waits for the read to retire.
#[test]
fn test_readers_are_tracked_on_inputs() {
    let (server, device) = CalcServer::new(&Settings::default());
    let vars = server.variables();
    vars.register("N", "unsigned int", "", "4").unwrap();
    vars.register("a", "float*", "N", "").unwrap();
    vars.register("sum", "float", "", "0").unwrap();
    upload_f32(&device, vars.require("a").unwrap().buffer().unwrap(), &[1.0, 1.0, 1.0, 1.0]);

    let mut reduction = Reduction::new("sum a", "a", "sum", "c = a + b;", "0");
    reduction.setup(&server).unwrap();
    riptide_core::execute(&mut reduction, &server).unwrap();

    let readers = vars.require("a").unwrap().reading_events();
    assert_eq!(readers.len(), 1, "the reduction must register itself as a reader of a");

    // A writer over `a` (the fill tool) gathers that reader into its wait
    // list and replaces the event set.
    let mut fill = Set::new("clear a", "a", "0", false);
    fill.setup(&server).unwrap();
    riptide_core::execute(&mut fill, &server).unwrap();
    server.finish().unwrap();

    let a = vars.require("a").unwrap();
    assert!(a.reading_events().is_empty(), "a writer clears the reader set");
    assert!(a.writing_event().is_some());
}

#[test]
fn test_once_tools_run_a_single_time() {
    let (server, _device) = CalcServer::new(&Settings::default());
    let vars = server.variables();
    vars.register("counter", "unsigned int", "", "0").unwrap();
    vars.register("step", "unsigned int", "", "1").unwrap();

    let mut pipeline = Pipeline::new();
    pipeline.push(Box::new(ScalarExpression::set_scalar(
        "bump once",
        "counter",
        "counter + step",
        true,
    )));
    pipeline.setup(&server).unwrap();

    for _ in 0..3 {
        pipeline.run_iteration(&server).unwrap();
        server.finish().unwrap();
    }
    assert_eq!(
        vars.require("counter").unwrap().scalar().unwrap(),
        ScalarValue::Uint(1),
        "a once tool must not run on later iterations"
    );
}

/// A failing assertion terminates the run; a passing one leaves the
/// pipeline state untouched.
#[test]
fn test_assert_fatality_and_transparency() {
    let (server, _device) = CalcServer::new(&Settings::default());
    let vars = server.variables();
    vars.register("N", "unsigned int", "", "10").unwrap();
    vars.register("h", "float", "", "0.1").unwrap();
    vars.register("steps", "unsigned int", "", "0").unwrap();

    let mut pipeline = Pipeline::new();
    pipeline.push(Box::new(ScalarExpression::assert("sanity", "(N > 0) && (h > 0)", false)));
    pipeline.push(Box::new(ScalarExpression::set_scalar("count", "steps", "steps + 1", false)));
    pipeline.setup(&server).unwrap();

    pipeline.run_iteration(&server).unwrap();
    server.finish().unwrap();
    assert_eq!(vars.require("steps").unwrap().scalar().unwrap(), ScalarValue::Uint(1));

    // Break the invariant; the pipeline aborts no later than the drain.
    let h = vars.require("h").unwrap();
    h.set_scalar(ScalarValue::Float(0.0)).unwrap();
    vars.populate(&h).unwrap();

    let outcome = pipeline.run_iteration(&server).and_then(|_| server.finish());
    assert!(
        matches!(outcome, Err(Error::AssertionFailed { .. })),
        "expected AssertionFailed, got {outcome:?}"
    );
}

/// Scalar expressions chain through their input scalars' events: a value
/// produced by one tool is seen by the next within the same iteration.
#[test]
fn test_scalar_chain_within_an_iteration() {
    let (server, device) = CalcServer::new(&Settings::default());
    let vars = server.variables();
    vars.register("N", "unsigned int", "", "4").unwrap();
    vars.register("a", "float*", "N", "").unwrap();
    vars.register("sum", "float", "", "0").unwrap();
    vars.register("mean", "float", "", "0").unwrap();
    upload_f32(&device, vars.require("a").unwrap().buffer().unwrap(), &[2.0, 4.0, 6.0, 8.0]);

    let mut pipeline = Pipeline::new();
    pipeline.push(Box::new(Reduction::new("sum a", "a", "sum", "c = a + b;", "0")));
    pipeline.push(Box::new(ScalarExpression::set_scalar("mean a", "mean", "sum / N", false)));
    pipeline.setup(&server).unwrap();

    pipeline.run_iteration(&server).unwrap();
    server.finish().unwrap();
    assert_eq!(vars.require("mean").unwrap().scalar().unwrap(), ScalarValue::Float(5.0));
}
