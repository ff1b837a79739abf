// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

//! End-to-end runs through the full stack: submission, dependence
//! analysis, mapping, dispatch, and completion on a live fabric.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use regent_core::{
    local_channels, sum_u64, CoherenceProperty, Color, Coloring, DefaultMapper, DependenceType,
    Domain, FieldId, FieldMask, LogicalRegion, MapFailure, Mapper, MappingDecision,
    NullProfilingSink, OpStatus, OperationKind, OperationRecord, Point, Predicate,
    PredicateHandle, PrivilegeMode, ProfilingSink, ReductionFlavor, ReductionOpId,
    RegionRequirement, Runtime, RuntimeConfig, TaskId, TaskLauncher, UniqueOpId, ViewRef,
};
use regent_lowlevel::{Event, Fabric, MachineDesc, ProcKind, Processor};

const NOOP: TaskId = TaskId(1);
const STORE: TaskId = TaskId(2);
const LOAD: TaskId = TaskId(3);
const BLOCKER: TaskId = TaskId(4);
const POKE: TaskId = TaskId(5);
const BUMP: TaskId = TaskId(6);
const SUM: ReductionOpId = ReductionOpId(7);

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

/// Profiling sink that records issue order and steals for assertions.
#[derive(Default)]
struct RecordingSink {
    issued: Mutex<Vec<UniqueOpId>>,
    stolen: Mutex<Vec<(UniqueOpId, Processor, Processor)>>,
}

impl ProfilingSink for RecordingSink {
    fn on_issued(&self, op: UniqueOpId) {
        self.issued.lock().push(op);
    }

    fn on_stolen(&self, op: UniqueOpId, victim: Processor, thief: Processor) {
        self.stolen.lock().push((op, victim, thief));
    }
}

/// Routes every operation to the first CPU except `POKE` launches, which
/// land on the second. Lets a test pile work onto one processor while the
/// other sits idle.
struct PinningMapper {
    inner: DefaultMapper,
}

impl Mapper for PinningMapper {
    fn select_target_processor(&mut self, fabric: &Fabric, op: &OperationRecord) -> Processor {
        let cpus = fabric.processors_of_kind(ProcKind::Cpu);
        let helper_bound =
            matches!(&op.kind, OperationKind::Task { task_id, .. } if *task_id == POKE);
        if helper_bound {
            cpus[1]
        } else {
            cpus[0]
        }
    }

    fn map_region(
        &mut self,
        fabric: &Fabric,
        op: &OperationRecord,
        index: usize,
        valid: &[(ViewRef, FieldMask)],
        feedback: &[MapFailure],
    ) -> MappingDecision {
        self.inner.map_region(fabric, op, index, valid, feedback)
    }
}

/// Delegates to the stock policy but pins every reduction instance to one
/// buffering flavor.
struct FlavorMapper {
    inner: DefaultMapper,
    flavor: ReductionFlavor,
}

impl Mapper for FlavorMapper {
    fn select_target_processor(&mut self, fabric: &Fabric, op: &OperationRecord) -> Processor {
        self.inner.select_target_processor(fabric, op)
    }

    fn map_region(
        &mut self,
        fabric: &Fabric,
        op: &OperationRecord,
        index: usize,
        valid: &[(ViewRef, FieldMask)],
        feedback: &[MapFailure],
    ) -> MappingDecision {
        match self.inner.map_region(fabric, op, index, valid, feedback) {
            MappingDecision::CreateReduction { memories, .. } => MappingDecision::CreateReduction {
                memories,
                flavor: self.flavor,
            },
            other => other,
        }
    }
}

fn boot(
    config: RuntimeConfig,
    cpus: usize,
    mapper: Box<dyn Mapper>,
    sink: Arc<dyn ProfilingSink>,
) -> Runtime {
    let (mut senders, mut inboxes) = local_channels(1);
    match Runtime::with_parts(
        config,
        MachineDesc::symmetric(cpus, 1, 1 << 20),
        mapper,
        sink,
        senders.swap_remove(0),
        inboxes.swap_remove(0),
    ) {
        Ok(rt) => rt,
        Err(e) => unreachable!("BUG: runtime failed to start: {e}"),
    }
}

fn region_with_fields(rt: &Runtime, sizes: &[usize]) -> (LogicalRegion, Vec<FieldId>) {
    let is = rt.create_index_space(Domain::interval(0, 16));
    let fs = rt.create_field_space();
    let fields: Vec<FieldId> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let field = FieldId(10 + i as u32);
            rt.allocate_field(fs, field, size).expect("field allocates");
            field
        })
        .collect();
    let region = rt.create_logical_region(is, fs).expect("region creates");
    (region, fields)
}

fn req(
    region: LogicalRegion,
    parent: LogicalRegion,
    fields: &[FieldId],
    privilege: PrivilegeMode,
    coherence: CoherenceProperty,
) -> RegionRequirement {
    RegionRequirement::new(region, parent, fields.to_vec(), privilege, coherence)
}

/// Argument bytes for `STORE`: one point byte, then the value.
fn store_args(point: u8, value: u64) -> Vec<u8> {
    let mut args = vec![point];
    args.extend_from_slice(&value.to_le_bytes());
    args
}

/// `STORE` writes its argument value at the argument point of every field
/// it mapped.
fn register_store(rt: &Runtime) {
    rt.register_task(STORE, "store", |tctx| {
        let pr = tctx.region(0).expect("store maps requirement 0");
        let point = Point::from(tctx.args[0]);
        for field in pr.fields() {
            pr.write(field, point, &tctx.args[1..9]).expect("store writes");
        }
        Vec::new()
    })
    .expect("store registers");
}

/// `LOAD` returns the bytes of every mapped field over the argument point
/// range, fields innermost.
fn register_load(rt: &Runtime) {
    rt.register_task(LOAD, "load", |tctx| {
        let pr = tctx.region(0).expect("load maps requirement 0");
        let mut out = Vec::new();
        for point in Point::from(tctx.args[0])..Point::from(tctx.args[1]) {
            for field in pr.fields() {
                out.extend(pr.read(field, point).expect("load reads"));
            }
        }
        out
    })
    .expect("load registers");
}

/// Waits for `event` on a side thread so a stuck trigger fails the test
/// instead of hanging it.
fn triggers_within(fabric: &Fabric, event: Event, timeout: Duration) -> bool {
    let (tx, rx) = bounded::<()>(1);
    let fab = fabric.clone();
    let _ = thread::spawn(move || {
        fab.wait(event);
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).is_ok()
}

// ----------------------------------------------------------------------------
// Dependence analysis through the runtime
// ----------------------------------------------------------------------------

#[test]
fn crossing_an_open_sibling_synthesizes_one_close_on_shared_fields() {
    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default(),
        2,
        Box::new(DefaultMapper::new()),
        sink.clone(),
    );
    rt.register_task(NOOP, "noop", |_| Vec::new())
        .expect("noop registers");

    let is = rt.create_index_space(Domain::interval(0, 8));
    let fs = rt.create_field_space();
    let fields = [FieldId(1), FieldId(2), FieldId(3)];
    for field in fields {
        rt.allocate_field(fs, field, 8).expect("field allocates");
    }
    let root = rt.create_logical_region(is, fs).expect("root region");
    // Overlapping children, so the siblings alias and a crossing must
    // flush the open one.
    let mut coloring = Coloring::new();
    coloring.insert(Color(0), Domain::interval(0, 5));
    coloring.insert(Color(1), Domain::interval(3, 8));
    let part = rt
        .forest()
        .create_index_partition(is, &coloring, Some(false))
        .expect("partition creates");
    let lpart = rt
        .forest()
        .get_logical_partition(root, part)
        .expect("logical partition");
    let left = rt
        .forest()
        .get_logical_subregion(lpart, Color(0))
        .expect("left child");
    let right = rt
        .forest()
        .get_logical_subregion(lpart, Color(1))
        .expect("right child");

    let ctx = rt.create_context();
    rt.grant_privilege(ctx, root, &fields, PrivilegeMode::ReadWrite)
        .expect("privilege grant");

    let reader_gate = PredicateHandle::new();
    let _reader = rt
        .submit_task(
            ctx,
            TaskLauncher::new(NOOP)
                .add_requirement(req(
                    left,
                    root,
                    &fields[..2],
                    PrivilegeMode::ReadOnly,
                    CoherenceProperty::Exclusive,
                ))
                .with_predicate(Predicate::Deferred(reader_gate.clone())),
        )
        .expect("reader submits");
    let writer_gate = PredicateHandle::new();
    let writer = rt
        .submit_task(
            ctx,
            TaskLauncher::new(NOOP)
                .add_requirement(req(
                    right,
                    root,
                    &fields[1..],
                    PrivilegeMode::ReadWrite,
                    CoherenceProperty::Exclusive,
                ))
                .with_predicate(Predicate::Deferred(writer_gate.clone())),
        )
        .expect("writer submits");

    let issued = sink.issued.lock().clone();
    assert_eq!(issued.len(), 3, "reader, writer, and exactly one close");
    let (reader_id, writer_id, close_id) = (issued[0], issued[1], issued[2]);

    let shared = rt
        .forest()
        .requirement_mask(fs, &fields[1..2])
        .expect("field mask");
    let writer_deps = rt.dependences_of(writer_id).expect("writer is live");
    let through_close = writer_deps
        .iter()
        .find(|d| d.predecessor == close_id)
        .expect("writer depends on the close");
    assert_eq!(through_close.kind, DependenceType::True);
    assert_eq!(through_close.mask, shared, "only the crossed field closes");
    assert!(
        !writer_deps.iter().any(|d| d.predecessor == reader_id),
        "ordering flows through the close, not directly"
    );
    let close_deps = rt.dependences_of(close_id).expect("close is live");
    assert!(
        close_deps.iter().any(|d| d.predecessor == reader_id),
        "the close waits for the reader it evicts"
    );

    reader_gate.set(true).expect("gate resolves once");
    writer_gate.set(true).expect("gate resolves once");
    rt.fabric().wait(writer.completion());
    rt.drain(ctx).expect("context drains");
    assert_eq!(rt.status_of(close_id), Some(OpStatus::Completed));
    rt.shutdown();
}

#[test]
fn simultaneous_writers_run_unordered_and_share_one_view() {
    const FIRST: u64 = 0xA1A1_A1A1_A1A1_A1A1;
    const SECOND: u64 = 0xB2B2_B2B2_B2B2_B2B2;

    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default(),
        2,
        Box::new(DefaultMapper::new()),
        sink.clone(),
    );
    register_store(&rt);
    register_load(&rt);
    let (region, fields) = region_with_fields(&rt, &[8]);
    let ctx = rt.create_context();
    rt.grant_privilege(ctx, region, &fields, PrivilegeMode::ReadWrite)
        .expect("privilege grant");

    let first_gate = PredicateHandle::new();
    let first = rt
        .submit_task(
            ctx,
            TaskLauncher::new(STORE)
                .with_args(store_args(0, FIRST))
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadWrite,
                    CoherenceProperty::Simultaneous,
                ))
                .with_predicate(Predicate::Deferred(first_gate.clone())),
        )
        .expect("first writer submits");
    let second_gate = PredicateHandle::new();
    let second = rt
        .submit_task(
            ctx,
            TaskLauncher::new(STORE)
                .with_args(store_args(1, SECOND))
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadWrite,
                    CoherenceProperty::Simultaneous,
                ))
                .with_predicate(Predicate::Deferred(second_gate.clone())),
        )
        .expect("second writer submits");

    let issued = sink.issued.lock().clone();
    let (first_id, second_id) = (issued[0], issued[1]);
    let deps = rt.dependences_of(second_id).expect("second writer is live");
    assert!(
        deps.iter()
            .any(|d| d.predecessor == first_id && d.kind == DependenceType::Simultaneous),
        "the overlap is recorded as a simultaneous edge"
    );
    assert!(
        deps.iter().all(|d| d.kind == DependenceType::Simultaneous),
        "no true or anti edge between concurrent writers"
    );

    // Releasing the second writer alone must let it finish: a simultaneous
    // edge carries no event ordering.
    second_gate.set(true).expect("gate resolves once");
    assert!(
        triggers_within(rt.fabric(), second.completion(), Duration::from_secs(5)),
        "a concurrent writer must not wait for its unresolved peer"
    );
    assert!(!rt.fabric().has_triggered(first.completion()));

    first_gate.set(true).expect("gate resolves once");
    rt.fabric().wait(first.completion());
    rt.submit_fence(ctx).expect("fence submits");
    let loaded = rt
        .submit_task(
            ctx,
            TaskLauncher::new(LOAD)
                .with_args(vec![0, 2])
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadOnly,
                    CoherenceProperty::Exclusive,
                )),
        )
        .expect("reader submits");
    let bytes = loaded.get(rt.fabric()).expect("reader returns bytes");
    let mut want = FIRST.to_le_bytes().to_vec();
    want.extend_from_slice(&SECOND.to_le_bytes());
    assert_eq!(bytes, want, "both stores land in one shared view");
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
}

#[test]
fn readers_order_on_their_writer_but_not_on_each_other() {
    const SEED: u64 = 0x5EED_5EED_5EED_5EED;

    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default(),
        4,
        Box::new(DefaultMapper::new()),
        sink.clone(),
    );
    register_store(&rt);
    register_load(&rt);
    let (region, fields) = region_with_fields(&rt, &[8, 8]);
    let ctx = rt.create_context();
    rt.grant_privilege(ctx, region, &fields, PrivilegeMode::ReadWrite)
        .expect("privilege grant");

    let gate = PredicateHandle::new();
    let _writer = rt
        .submit_task(
            ctx,
            TaskLauncher::new(STORE)
                .with_args(store_args(0, SEED))
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadWrite,
                    CoherenceProperty::Exclusive,
                ))
                .with_predicate(Predicate::Deferred(gate.clone())),
        )
        .expect("writer submits");
    let wide = rt
        .submit_task(
            ctx,
            TaskLauncher::new(LOAD).with_args(vec![0, 1]).add_requirement(req(
                region,
                region,
                &fields,
                PrivilegeMode::ReadOnly,
                CoherenceProperty::Exclusive,
            )),
        )
        .expect("wide reader submits");
    let narrow = rt
        .submit_task(
            ctx,
            TaskLauncher::new(LOAD).with_args(vec![0, 1]).add_requirement(req(
                region,
                region,
                &fields[..1],
                PrivilegeMode::ReadOnly,
                CoherenceProperty::Exclusive,
            )),
        )
        .expect("narrow reader submits");

    let issued = sink.issued.lock().clone();
    let (writer_id, wide_id, narrow_id) = (issued[0], issued[1], issued[2]);
    let wide_deps = rt.dependences_of(wide_id).expect("wide reader is live");
    assert!(wide_deps
        .iter()
        .any(|d| d.predecessor == writer_id && d.kind == DependenceType::True));
    let narrow_deps = rt.dependences_of(narrow_id).expect("narrow reader is live");
    let on_writer = narrow_deps
        .iter()
        .find(|d| d.predecessor == writer_id)
        .expect("narrow reader depends on the writer");
    assert_eq!(on_writer.kind, DependenceType::True);
    let f0 = rt
        .forest()
        .requirement_mask(region.field_space, &fields[..1])
        .expect("field mask");
    assert_eq!(on_writer.mask, f0, "the edge carries only the read field");
    assert!(
        !narrow_deps.iter().any(|d| d.predecessor == wide_id),
        "two readers never order on each other"
    );

    gate.set(true).expect("gate resolves once");
    let mut wide_want = SEED.to_le_bytes().to_vec();
    wide_want.extend_from_slice(&SEED.to_le_bytes());
    assert_eq!(
        wide.get(rt.fabric()).expect("wide reader returns bytes"),
        wide_want
    );
    assert_eq!(
        narrow.get(rt.fabric()).expect("narrow reader returns bytes"),
        SEED.to_le_bytes().to_vec()
    );
    rt.drain(ctx).expect("context drains");
    assert_eq!(rt.status_of(writer_id), Some(OpStatus::Completed));
    rt.shutdown();
}

#[test]
fn a_discarding_writer_takes_an_anti_edge_and_its_value_wins() {
    const OLD: u64 = 0x0101_0101_0101_0101;
    const NEW: u64 = 0xFEFE_FEFE_FEFE_FEFE;

    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default(),
        2,
        Box::new(DefaultMapper::new()),
        sink.clone(),
    );
    register_store(&rt);
    register_load(&rt);
    let (region, fields) = region_with_fields(&rt, &[8]);
    let ctx = rt.create_context();
    rt.grant_privilege(ctx, region, &fields, PrivilegeMode::ReadWrite)
        .expect("privilege grant");

    let first_gate = PredicateHandle::new();
    let _first = rt
        .submit_task(
            ctx,
            TaskLauncher::new(STORE)
                .with_args(store_args(0, OLD))
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadWrite,
                    CoherenceProperty::Exclusive,
                ))
                .with_predicate(Predicate::Deferred(first_gate.clone())),
        )
        .expect("first writer submits");
    let second_gate = PredicateHandle::new();
    let _second = rt
        .submit_task(
            ctx,
            TaskLauncher::new(STORE)
                .with_args(store_args(0, NEW))
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::WriteDiscard,
                    CoherenceProperty::Exclusive,
                ))
                .with_predicate(Predicate::Deferred(second_gate.clone())),
        )
        .expect("discarding writer submits");

    let issued = sink.issued.lock().clone();
    let (first_id, second_id) = (issued[0], issued[1]);
    let deps = rt.dependences_of(second_id).expect("discarding writer is live");
    let on_first = deps
        .iter()
        .find(|d| d.predecessor == first_id)
        .expect("the discard still orders after the writer");
    assert_eq!(
        on_first.kind,
        DependenceType::Anti,
        "a full overwrite never reads the old value"
    );
    assert!(!deps.iter().any(|d| d.kind == DependenceType::True));

    first_gate.set(true).expect("gate resolves once");
    second_gate.set(true).expect("gate resolves once");
    rt.submit_fence(ctx).expect("fence submits");
    let loaded = rt
        .submit_task(
            ctx,
            TaskLauncher::new(LOAD)
                .with_args(vec![0, 1])
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadOnly,
                    CoherenceProperty::Exclusive,
                )),
        )
        .expect("reader submits");
    assert_eq!(
        loaded.get(rt.fabric()).expect("reader returns bytes"),
        NEW.to_le_bytes().to_vec(),
        "the discarding writer's value survives"
    );
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
}

// ----------------------------------------------------------------------------
// Scheduling
// ----------------------------------------------------------------------------

#[test]
fn an_idle_processor_steals_queued_tasks_from_a_busy_one() {
    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default().with_min_tasks_to_keep(0),
        2,
        Box::new(PinningMapper {
            inner: DefaultMapper::new(),
        }),
        sink.clone(),
    );
    let (entered_tx, entered_rx) = bounded::<()>(1);
    let (hold_tx, hold_rx) = bounded::<()>(1);
    rt.register_task(BLOCKER, "blocker", move |_| {
        let _ = entered_tx.send(());
        let _ = hold_rx.recv();
        Vec::new()
    })
    .expect("blocker registers");
    rt.register_task(NOOP, "noop", |_| Vec::new())
        .expect("noop registers");
    rt.register_task(POKE, "poke", |_| Vec::new())
        .expect("poke registers");

    let ctx = rt.create_context();
    let _blocker = rt
        .submit_task(ctx, TaskLauncher::new(BLOCKER))
        .expect("blocker submits");
    assert!(
        entered_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "the blocker must start before the backlog builds"
    );

    // Four ready tasks pile up behind the stuck processor, then the poke
    // wakes the idle one.
    let workers: Vec<_> = (0..4)
        .map(|_| {
            rt.submit_task(ctx, TaskLauncher::new(NOOP))
                .expect("worker submits")
        })
        .collect();
    let poke = rt
        .submit_task(ctx, TaskLauncher::new(POKE))
        .expect("poke submits");

    let events: Vec<Event> = workers.iter().map(|w| w.completion()).collect();
    let all = rt.fabric().merge_events(&events);
    assert!(
        triggers_within(rt.fabric(), all, Duration::from_secs(5)),
        "the backlog must finish while its home processor stays stuck"
    );
    assert!(triggers_within(
        rt.fabric(),
        poke.completion(),
        Duration::from_secs(5)
    ));

    let cpus = rt.fabric().processors_of_kind(ProcKind::Cpu);
    let issued = sink.issued.lock().clone();
    let worker_ids = &issued[1..5];
    let stolen = sink.stolen.lock().clone();
    assert!(!stolen.is_empty(), "the idle processor must steal");
    for (id, victim, thief) in &stolen {
        assert!(worker_ids.contains(id), "only queued workers move");
        assert_eq!(victim.raw(), cpus[0].raw());
        assert_eq!(thief.raw(), cpus[1].raw());
    }

    hold_tx.send(()).expect("blocker releases");
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
}

#[test]
fn the_keep_floor_shields_a_victims_last_tasks() {
    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default().with_min_tasks_to_keep(2),
        2,
        Box::new(PinningMapper {
            inner: DefaultMapper::new(),
        }),
        sink.clone(),
    );
    let (entered_tx, entered_rx) = bounded::<()>(1);
    let (hold_tx, hold_rx) = bounded::<()>(1);
    rt.register_task(BLOCKER, "blocker", move |_| {
        let _ = entered_tx.send(());
        let _ = hold_rx.recv();
        Vec::new()
    })
    .expect("blocker registers");
    rt.register_task(NOOP, "noop", |_| Vec::new())
        .expect("noop registers");
    rt.register_task(POKE, "poke", |_| Vec::new())
        .expect("poke registers");

    let ctx = rt.create_context();
    let _blocker = rt
        .submit_task(ctx, TaskLauncher::new(BLOCKER))
        .expect("blocker submits");
    assert!(
        entered_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "the blocker must start before the backlog builds"
    );

    let kept_a = rt
        .submit_task(ctx, TaskLauncher::new(NOOP))
        .expect("worker submits");
    let kept_b = rt
        .submit_task(ctx, TaskLauncher::new(NOOP))
        .expect("worker submits");
    let poke = rt
        .submit_task(ctx, TaskLauncher::new(POKE))
        .expect("poke submits");
    assert!(triggers_within(
        rt.fabric(),
        poke.completion(),
        Duration::from_secs(5)
    ));

    // Give the idle processor time to attempt a theft it must refuse.
    thread::sleep(Duration::from_millis(200));
    assert!(
        sink.stolen.lock().is_empty(),
        "a backlog at the floor stays with its owner"
    );
    assert!(!rt.fabric().has_triggered(kept_a.completion()));
    assert!(!rt.fabric().has_triggered(kept_b.completion()));

    hold_tx.send(()).expect("blocker releases");
    let both = rt
        .fabric()
        .merge_events(&[kept_a.completion(), kept_b.completion()]);
    assert!(
        triggers_within(rt.fabric(), both, Duration::from_secs(5)),
        "the owner finishes its own backlog once unstuck"
    );
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
}

// ----------------------------------------------------------------------------
// Reductions
// ----------------------------------------------------------------------------

fn reduction_total(flavor: ReductionFlavor) -> Vec<u8> {
    let rt = boot(
        RuntimeConfig::default(),
        2,
        Box::new(FlavorMapper {
            inner: DefaultMapper::new(),
            flavor,
        }),
        Arc::new(NullProfilingSink),
    );
    register_store(&rt);
    register_load(&rt);
    rt.register_task(BUMP, "bump", |tctx| {
        let pr = tctx.region(0).expect("bump maps requirement 0");
        let field = pr.fields().next().expect("bump region has a field");
        pr.reduce(field, 0, &tctx.args[..8]).expect("contribution applies");
        Vec::new()
    })
    .expect("bump registers");
    rt.register_reduction_op(SUM, sum_u64()).expect("sum registers");

    let (region, fields) = region_with_fields(&rt, &[8]);
    let ctx = rt.create_context();
    rt.grant_privilege(ctx, region, &fields, PrivilegeMode::ReadWrite)
        .expect("privilege grant");

    let init = rt
        .submit_task(
            ctx,
            TaskLauncher::new(STORE)
                .with_args(store_args(0, 100))
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadWrite,
                    CoherenceProperty::Exclusive,
                )),
        )
        .expect("init submits");
    rt.fabric().wait(init.completion());

    for amount in [5u64, 9] {
        rt.submit_task(
            ctx,
            TaskLauncher::new(BUMP)
                .with_args(amount.to_le_bytes().to_vec())
                .add_requirement(RegionRequirement::reduction(
                    region,
                    region,
                    fields.clone(),
                    SUM,
                    CoherenceProperty::Exclusive,
                )),
        )
        .expect("contribution submits");
    }

    rt.submit_fence(ctx).expect("fence submits");
    let reader = rt
        .submit_task(
            ctx,
            TaskLauncher::new(LOAD)
                .with_args(vec![0, 1])
                .add_requirement(req(
                    region,
                    region,
                    &fields,
                    PrivilegeMode::ReadOnly,
                    CoherenceProperty::Exclusive,
                )),
        )
        .expect("reader submits");
    let bytes = reader.get(rt.fabric()).expect("reader returns bytes");
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
    bytes
}

#[test]
fn list_and_fold_reductions_agree_on_the_total() {
    let list = reduction_total(ReductionFlavor::List);
    assert_eq!(
        list,
        114u64.to_le_bytes().to_vec(),
        "base plus each contribution exactly once"
    );
    let fold = reduction_total(ReductionFlavor::Fold);
    assert_eq!(list, fold, "buffering flavor never changes the answer");
}

// ----------------------------------------------------------------------------
// The task window
// ----------------------------------------------------------------------------

#[test]
fn a_full_window_stalls_submission_until_a_slot_frees() {
    let rt = boot(
        RuntimeConfig::default().with_max_task_window(1),
        2,
        Box::new(DefaultMapper::new()),
        Arc::new(NullProfilingSink),
    );
    rt.register_task(NOOP, "noop", |_| Vec::new())
        .expect("noop registers");
    let ctx = rt.create_context();
    let gate = PredicateHandle::new();
    let held = rt
        .submit_task(
            ctx,
            TaskLauncher::new(NOOP).with_predicate(Predicate::Deferred(gate.clone())),
        )
        .expect("gated task submits");

    let (tx, rx) = bounded::<()>(1);
    thread::scope(|s| {
        let _submitter = s.spawn(|| {
            let second = rt
                .submit_task(ctx, TaskLauncher::new(NOOP))
                .expect("second task submits");
            let _ = tx.send(());
            rt.fabric().wait(second.completion());
        });
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "the window must hold the second submission"
        );
        gate.set(true).expect("gate resolves once");
        assert!(
            rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "dispatch frees the slot"
        );
    });
    rt.fabric().wait(held.completion());
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
}

#[test]
fn a_false_predicate_frees_its_window_slot_and_cancels() {
    let sink = Arc::new(RecordingSink::default());
    let rt = boot(
        RuntimeConfig::default().with_max_task_window(1),
        2,
        Box::new(DefaultMapper::new()),
        sink.clone(),
    );
    rt.register_task(NOOP, "noop", |_| Vec::new())
        .expect("noop registers");
    let ctx = rt.create_context();
    let gate = PredicateHandle::new();
    let doomed = rt
        .submit_task(
            ctx,
            TaskLauncher::new(NOOP).with_predicate(Predicate::Deferred(gate.clone())),
        )
        .expect("gated task submits");

    let (tx, rx) = bounded::<()>(1);
    thread::scope(|s| {
        let _submitter = s.spawn(|| {
            let second = rt
                .submit_task(ctx, TaskLauncher::new(NOOP))
                .expect("second task submits");
            let _ = tx.send(());
            rt.fabric().wait(second.completion());
        });
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "the window must hold the second submission"
        );
        gate.set(false).expect("gate resolves once");
        assert!(
            rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "a cancelled task frees its slot"
        );
    });
    assert!(
        doomed.get(rt.fabric()).is_none(),
        "a cancelled task yields no result"
    );
    let doomed_id = sink.issued.lock()[0];
    assert_eq!(rt.status_of(doomed_id), Some(OpStatus::Cancelled));
    rt.drain(ctx).expect("context drains");
    rt.shutdown();
}
