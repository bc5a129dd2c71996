use std::sync::Arc;

use strata::{
    DeviceInfo, Dims, HostDevice, LocalHub, Model, SchedError, ScheduleOptions, Scheduler,
    TensorType,
};

fn dims(v: &[i64]) -> Dims {
    Dims::new(v.to_vec()).unwrap()
}

fn device() -> Arc<HostDevice> {
    Arc::new(HostDevice::new(DeviceInfo {
        sm_count: 4,
        warps_per_sm: 16,
        bytes_free: 1 << 24,
    }))
}

/// Rank 0 exports a tensor under sid 7; rank 1 imports it. Both ranks
/// schedule, rank 1's BufInfo points at gpu 0 and rank 0's records the
/// export sid.
#[test]
fn test_two_rank_export_import() {
    let hub = LocalHub::new();

    let mut m0 = Model::new();
    let t = m0.tensor(dims(&[64]), TensorType::Fp32).unwrap();
    m0.export(t, 7);
    let plan0 = Scheduler::new(m0, 0, 0, 2, device(), Arc::new(hub.transport_for(0)))
        .schedule()
        .unwrap();

    let mut m1 = Model::new();
    let r = m1.import(dims(&[64]), TensorType::Fp32, 0, 7).unwrap();
    let s = m1.relu(r).unwrap();
    m1.mark_output(s);
    let plan1 = Scheduler::new(m1, 1, 1, 2, device(), Arc::new(hub.transport_for(1)))
        .schedule()
        .unwrap();

    let exported = &plan0.buf_infos[0];
    assert_eq!(exported.sid, 7);
    assert_eq!(exported.gpu_id, 0);

    let imported = plan1
        .buf_infos
        .iter()
        .find(|b| b.sid == 7)
        .expect("imported buffer missing from plan");
    assert_eq!(imported.gpu_id, 0);

    // The import resolves to the address rank 0 published.
    let t0 = plan0.model().get_tensor(strata::TensorId(0));
    let t1 = plan1.model().get_tensor(strata::TensorId(0));
    assert_eq!(
        plan0.resolve_tensor(t0).unwrap().addr(),
        plan1.resolve_tensor(t1).unwrap().addr()
    );
}

/// An import that nobody publishes fails with `ImportUnresolved` once the
/// deadline passes.
#[test]
fn test_unpublished_import_times_out() {
    let hub = LocalHub::new();
    let mut m = Model::new();
    let r = m.import(dims(&[64]), TensorType::Fp32, 0, 99).unwrap();
    let s = m.relu(r).unwrap();
    m.mark_output(s);

    let err = Scheduler::new(m, 1, 1, 2, device(), Arc::new(hub.transport_for(1)))
        .with_options(ScheduleOptions {
            import_deadline_ms: 10,
            ..ScheduleOptions::default()
        })
        .schedule()
        .unwrap_err();
    assert!(matches!(
        err,
        SchedError::ImportUnresolved { rank: 0, sid: 99, .. }
    ));
}

/// Send/recv across two ranks: both schedules succeed and the
/// communication ops sit in isolated depths packed as one entry.
#[test]
fn test_send_recv_depth_isolation() {
    let hub = LocalHub::new();

    let mut m0 = Model::new();
    let x = m0.tensor(dims(&[256]), TensorType::Fp32).unwrap();
    let y = m0.relu(x).unwrap();
    let flag = m0.send(y, 1, 9).unwrap();
    m0.mark_output(flag);
    let plan0 = Scheduler::new(m0, 0, 0, 2, device(), Arc::new(hub.transport_for(0)))
        .schedule()
        .unwrap();

    let mut m1 = Model::new();
    let r = m1.recv(dims(&[256]), TensorType::Fp32, 0, 9).unwrap();
    let o = m1.scale(r, 2.0).unwrap();
    m1.mark_output(o);
    let plan1 = Scheduler::new(m1, 1, 1, 2, device(), Arc::new(hub.transport_for(1)))
        .schedule()
        .unwrap();

    // Rank 0: relu depth, then the send alone in one entry.
    assert_eq!(plan0.num_depths(), 2);
    assert_eq!(plan0.launches[1].len(), 1);
    assert!(plan0.kernel_sources[1].contains("comm_put"));

    // Rank 1: recv depth first, then the scale.
    assert_eq!(plan1.num_depths(), 2);
    assert_eq!(plan1.launches[0].len(), 1);
    assert!(plan1.kernel_sources[0].contains("comm_wait"));

    // The recv buffer is exported so the sender can reach it.
    assert!(plan1.buf_infos.iter().any(|b| b.sid == 9 && b.gpu_id == 1));
}
