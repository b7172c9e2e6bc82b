//! The `state` import namespace: how a guest reads and writes stores.
//!
//! Writers act on the instance's single output store. Readers address the
//! read-only input stores by index and hand values back through the heap:
//! the host copies the value into a fresh guest allocation and stores
//! `(ptr u32 LE, len u32 LE)` at the guest's `out_ptr`. Those copies are
//! freed when the heap is cleared after the block.
//!
//! Any store or bridge error traps the guest call.

use anyhow::Result;
use strata_state::{BigFloat, BigInt, Builder, StoreResult};
use wasmtime::{AsContextMut, Caller, Linker};

use crate::error::RuntimeError;
use crate::host::{HostState, with_heap};

pub const STATE_NAMESPACE: &str = "state";

type BytesOp = fn(&mut Builder, u64, String, &[u8]) -> StoreResult<()>;
type Int64Op = fn(&mut Builder, u64, String, i64) -> StoreResult<()>;
type Float64Op = fn(&mut Builder, u64, String, f64) -> StoreResult<()>;

pub fn register_state_imports(linker: &mut Linker<HostState>) -> Result<()> {
    bytes_writer(linker, "set", |b, ord, key, value| b.set(ord, key, value))?;
    bytes_writer(linker, "set_if_not_exists", |b, ord, key, value| {
        b.set_if_not_exists(ord, key, value)
    })?;
    bytes_writer(linker, "append", |b, ord, key, value| b.append(ord, key, value))?;

    int64_writer(linker, "sum_int64", |b, ord, key, v| b.sum_int64(ord, key, v))?;
    int64_writer(linker, "set_min_int64", |b, ord, key, v| b.set_min_int64(ord, key, v))?;
    int64_writer(linker, "set_max_int64", |b, ord, key, v| b.set_max_int64(ord, key, v))?;

    float64_writer(linker, "sum_float64", |b, ord, key, v| b.sum_float64(ord, key, v))?;
    float64_writer(linker, "set_min_float64", |b, ord, key, v| b.set_min_float64(ord, key, v))?;
    float64_writer(linker, "set_max_float64", |b, ord, key, v| b.set_max_float64(ord, key, v))?;

    bytes_writer(linker, "sum_bigint", |b, ord, key, text| {
        let delta: BigInt = b.decode_value(&key, text)?;
        b.sum_bigint(ord, key, &delta)
    })?;
    bytes_writer(linker, "set_min_bigint", |b, ord, key, text| {
        let value: BigInt = b.decode_value(&key, text)?;
        b.set_min_bigint(ord, key, &value)
    })?;
    bytes_writer(linker, "set_max_bigint", |b, ord, key, text| {
        let value: BigInt = b.decode_value(&key, text)?;
        b.set_max_bigint(ord, key, &value)
    })?;
    bytes_writer(linker, "sum_bigfloat", |b, ord, key, text| {
        let delta: BigFloat = b.decode_value(&key, text)?;
        b.sum_bigfloat(ord, key, &delta)
    })?;
    bytes_writer(linker, "set_min_bigfloat", |b, ord, key, text| {
        let value: BigFloat = b.decode_value(&key, text)?;
        b.set_min_bigfloat(ord, key, &value)
    })?;
    bytes_writer(linker, "set_max_bigfloat", |b, ord, key, text| {
        let value: BigFloat = b.decode_value(&key, text)?;
        b.set_max_bigfloat(ord, key, &value)
    })?;

    linker.func_wrap(
        STATE_NAMESPACE,
        "delete_prefix",
        |mut caller: Caller<'_, HostState>, ord: i64, prefix_ptr: i32, prefix_len: i32| -> Result<()> {
            let result: Result<(), RuntimeError> = (|| {
                let ord = ordinal(ord)?;
                let prefix = read_string(&mut caller, prefix_ptr, prefix_len)?;
                caller.data_mut().writer_mut()?.delete_prefix(ord, &prefix)?;
                Ok(())
            })();
            result.map_err(trap)
        },
    )?;

    linker.func_wrap(
        STATE_NAMESPACE,
        "get_at",
        |mut caller: Caller<'_, HostState>,
         store_idx: i32,
         ord: i64,
         key_ptr: i32,
         key_len: i32,
         out_ptr: i32|
         -> Result<i32> {
            let result = ordinal(ord).and_then(|ord| {
                lookup(&mut caller, store_idx, key_ptr, key_len, out_ptr, |store, key| {
                    store.get_at(ord, key)
                })
            });
            result.map_err(trap)
        },
    )?;
    linker.func_wrap(
        STATE_NAMESPACE,
        "get_first",
        |mut caller: Caller<'_, HostState>,
         store_idx: i32,
         key_ptr: i32,
         key_len: i32,
         out_ptr: i32|
         -> Result<i32> {
            lookup(&mut caller, store_idx, key_ptr, key_len, out_ptr, Builder::get_first)
                .map_err(trap)
        },
    )?;
    linker.func_wrap(
        STATE_NAMESPACE,
        "get_last",
        |mut caller: Caller<'_, HostState>,
         store_idx: i32,
         key_ptr: i32,
         key_len: i32,
         out_ptr: i32|
         -> Result<i32> {
            lookup(&mut caller, store_idx, key_ptr, key_len, out_ptr, Builder::get_last)
                .map_err(trap)
        },
    )?;

    linker.func_wrap(
        STATE_NAMESPACE,
        "output",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_bytes(&mut caller, ptr, len).map_err(trap)?;
            caller.data_mut().output = Some(bytes);
            Ok(())
        },
    )?;
    Ok(())
}

fn bytes_writer(linker: &mut Linker<HostState>, name: &str, op: BytesOp) -> Result<()> {
    linker.func_wrap(
        STATE_NAMESPACE,
        name,
        move |mut caller: Caller<'_, HostState>,
              ord: i64,
              key_ptr: i32,
              key_len: i32,
              val_ptr: i32,
              val_len: i32|
              -> Result<()> {
            let result: Result<(), RuntimeError> = (|| {
                let ord = ordinal(ord)?;
                let key = read_string(&mut caller, key_ptr, key_len)?;
                let value = read_bytes(&mut caller, val_ptr, val_len)?;
                op(caller.data_mut().writer_mut()?, ord, key, &value)?;
                Ok(())
            })();
            result.map_err(trap)
        },
    )?;
    Ok(())
}

fn int64_writer(linker: &mut Linker<HostState>, name: &str, op: Int64Op) -> Result<()> {
    linker.func_wrap(
        STATE_NAMESPACE,
        name,
        move |mut caller: Caller<'_, HostState>, ord: i64, key_ptr: i32, key_len: i32, value: i64| -> Result<()> {
            let result: Result<(), RuntimeError> = (|| {
                let ord = ordinal(ord)?;
                let key = read_string(&mut caller, key_ptr, key_len)?;
                op(caller.data_mut().writer_mut()?, ord, key, value)?;
                Ok(())
            })();
            result.map_err(trap)
        },
    )?;
    Ok(())
}

fn float64_writer(linker: &mut Linker<HostState>, name: &str, op: Float64Op) -> Result<()> {
    linker.func_wrap(
        STATE_NAMESPACE,
        name,
        move |mut caller: Caller<'_, HostState>, ord: i64, key_ptr: i32, key_len: i32, value: f64| -> Result<()> {
            let result: Result<(), RuntimeError> = (|| {
                let ord = ordinal(ord)?;
                let key = read_string(&mut caller, key_ptr, key_len)?;
                op(caller.data_mut().writer_mut()?, ord, key, value)?;
                Ok(())
            })();
            result.map_err(trap)
        },
    )?;
    Ok(())
}

fn lookup(
    caller: &mut Caller<'_, HostState>,
    store_idx: i32,
    key_ptr: i32,
    key_len: i32,
    out_ptr: i32,
    read: impl for<'s> FnOnce(&'s Builder, &str) -> Option<&'s [u8]>,
) -> Result<i32, RuntimeError> {
    let key = read_string(caller, key_ptr, key_len)?;
    let Some(value) = read(caller.data().reader(store_idx)?, &key).map(<[u8]>::to_vec) else {
        return Ok(0);
    };
    with_heap(caller.as_context_mut(), |heap, guest| {
        let ptr = heap.write(guest, &value)?;
        let mut slot = [0u8; 8];
        slot[..4].copy_from_slice(&ptr.to_le_bytes());
        slot[4..].copy_from_slice(&(value.len() as u32).to_le_bytes());
        heap.write_at_ptr(guest, &slot, out_ptr as u32)
    })?;
    Ok(1)
}

fn read_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
    with_heap(caller.as_context_mut(), |heap, guest| {
        heap.read_bytes(guest, ptr as u32, len as u32)
    })
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Result<String, RuntimeError> {
    with_heap(caller.as_context_mut(), |heap, guest| {
        heap.read_string(guest, ptr as u32, len as u32)
    })
}

fn ordinal(ord: i64) -> Result<u64, RuntimeError> {
    u64::try_from(ord).map_err(|_| RuntimeError::NegativeOrdinal(ord))
}

/// Host errors travel through wasmtime as `anyhow` and are downcast again
/// once the guest call unwinds.
fn trap(err: RuntimeError) -> anyhow::Error {
    anyhow::Error::new(err)
}
