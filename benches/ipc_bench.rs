//! Benchmarks for the transaction path
//!
//! Parcel encoding and stub dispatch sit on every client call, so their
//! cost bounds how fast a client can drive the daemon.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use displayd_core::config::Config;
use displayd_core::ipc::{dispatch, CallerInfo, MessageOption, Parcel, RequestContext};
use displayd_core::manager_service::{
    value_id, SessionManagerServiceCode, SessionManagerServiceStub,
    SESSION_MANAGER_SERVICE_DESCRIPTOR,
};
use displayd_core::session::SessionInfo;
use displayd_core::{DisplayContext, SessionManagerServiceProxy};

fn parcel_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("parcel");

    let info = SessionInfo {
        bundle_name: "com.example.notes".into(),
        module_name: "entry".into(),
        ability_name: "MainAbility".into(),
        persistent_id: 42,
        ..SessionInfo::default()
    };
    group.bench_function("encode_session_info", |b| {
        b.iter(|| {
            let mut data = Parcel::new();
            data.write_interface_token(SESSION_MANAGER_SERVICE_DESCRIPTOR);
            data.write_parcelable(Some(black_box(&info)));
            data
        });
    });

    for len in [4, 64, 1024] {
        let values: Vec<i32> = (0..len).collect();
        group.bench_with_input(BenchmarkId::new("i32_vec_round_trip", len), &values, |b, v| {
            b.iter(|| {
                let mut data = Parcel::new();
                data.write_i32_vec(black_box(v));
                let mut data = Parcel::from_bytes(data.as_bytes().to_vec());
                data.read_i32_vec(2048)
            });
        });
    }

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let context = DisplayContext::with_defaults(&Config::default());
    let stub = SessionManagerServiceStub::new(Arc::clone(context.service()));
    let ctx = RequestContext {
        caller: CallerInfo::local(),
        option: MessageOption::SYNC,
    };

    group.bench_function("stub_get_value", |b| {
        b.iter(|| {
            let mut data = Parcel::new();
            data.write_interface_token(SESSION_MANAGER_SERVICE_DESCRIPTOR);
            data.write_i32(value_id::POWER_STATE);
            let mut reply = Parcel::new();
            let _ = dispatch(
                &stub,
                SessionManagerServiceCode::GetValueById.into(),
                &mut data,
                &mut reply,
                &ctx,
            );
            reply
        });
    });

    let proxy = SessionManagerServiceProxy::new(context.service_handle()).unwrap();
    group.bench_function("binder_get_value", |b| {
        b.iter(|| proxy.get_value_by_id(black_box(value_id::SESSION_COUNT)));
    });

    group.finish();
}

criterion_group!(benches, parcel_benchmark, dispatch_benchmark);
criterion_main!(benches);
