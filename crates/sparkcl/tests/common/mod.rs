//! Shared fixtures: kernel sources with matching host implementations for
//! the reference device.

#![allow(dead_code)]

use std::sync::Arc;

use sparkcl::driver::{HostKernel, KernelFault, ReferenceDriver};
use sparkcl::{RuntimeConfig, RuntimeContext};

pub const DOUBLE_SOURCE: &str = r#"
// Doubles every element below n.
__kernel void double_values(__global float* data, const uint n)
{
    const uint gid = get_global_id(0);
    if (gid < n) {
        data[gid] = 2.0f * data[gid];
    }
}
"#;

pub const FILL_SOURCE: &str = r#"
__kernel void fill(float value, __global float* out)
{
    out[get_global_id(0)] = value;
}
"#;

pub const ADD_SOURCE: &str = r#"
__kernel void add(__global const int* a, __global const int* b, __global int* out)
{
    const size_t i = get_global_id(0);
    out[i] = a[i] + b[i];
}
"#;

pub const BLOCK_SUM_SOURCE: &str = r#"
/* One partial sum per work-group. */
__kernel void block_sum(__global const float* input,
                        __global float* partial,
                        __local float* scratch)
{
    const size_t lid = get_local_id(0);
    scratch[lid] = input[get_global_id(0)];
    barrier(CLK_LOCAL_MEM_FENCE);
    if (lid == 0) {
        float acc = 0.0f;
        for (size_t i = 0; i < get_local_size(0); ++i) {
            acc += scratch[i];
        }
        partial[get_group_id(0)] = acc;
    }
}
"#;

pub fn double_values() -> HostKernel {
    HostKernel::new("double_values", |inv| {
        let n = inv.scalar::<u32>(1)? as usize;
        for [gid, _, _] in inv.global_ids() {
            if gid < n {
                let v: f32 = inv.load(0, gid)?;
                inv.store(0, gid, 2.0 * v)?;
            }
        }
        Ok(())
    })
}

pub fn fill() -> HostKernel {
    HostKernel::new("fill", |inv| {
        let value: f32 = inv.scalar(0)?;
        for [gid, _, _] in inv.global_ids() {
            inv.store(1, gid, value)?;
        }
        Ok(())
    })
}

pub fn add() -> HostKernel {
    HostKernel::new("add", |inv| {
        for [i, _, _] in inv.global_ids() {
            let a: i32 = inv.load(0, i)?;
            let b: i32 = inv.load(1, i)?;
            inv.store(2, i, a.wrapping_add(b))?;
        }
        Ok(())
    })
}

pub fn block_sum() -> HostKernel {
    HostKernel::new("block_sum", |inv| {
        let group = inv.local_size(0);
        if inv.len::<f32>(2)? < group {
            return Err(KernelFault::Failed("scratch is smaller than the work-group".into()));
        }
        for [gid, _, _] in inv.global_ids() {
            let v: f32 = inv.load(0, gid)?;
            inv.store(2, gid % group, v)?;
            if gid % group == group - 1 {
                let mut acc = 0.0f32;
                for i in 0..group {
                    acc += inv.load::<f32>(2, i)?;
                }
                inv.store(1, gid / group, acc)?;
            }
        }
        Ok(())
    })
}

pub fn host_kernels() -> Vec<HostKernel> {
    vec![double_values(), fill(), add(), block_sum()]
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Reference device with every fixture kernel registered.
pub fn runtime_with(unified: bool, config: RuntimeConfig) -> (Arc<ReferenceDriver>, RuntimeContext) {
    init_tracing();
    let driver = Arc::new(
        ReferenceDriver::builder().unified_memory(unified).kernels(host_kernels()).build(),
    );
    let rt = RuntimeContext::with_driver(driver.clone(), config).expect("runtime");
    (driver, rt)
}

pub fn runtime(unified: bool) -> (Arc<ReferenceDriver>, RuntimeContext) {
    runtime_with(unified, RuntimeConfig::default())
}

pub fn profiled_runtime(unified: bool) -> (Arc<ReferenceDriver>, RuntimeContext) {
    runtime_with(unified, RuntimeConfig::default().with_profiling(true))
}
