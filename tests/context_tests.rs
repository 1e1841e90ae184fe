//! Integration tests for current-device selection and device scopes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rdna_stack::config::Config;
use rdna_stack::{ErrorKind, Runtime, SimulatedDriver};

fn runtime(devices: usize) -> Runtime {
    let rt = Runtime::new(Arc::new(SimulatedDriver::rx6800xt(devices)), Config::default()).unwrap();
    rt.initialize();
    rt
}

#[derive(Debug)]
struct KernelFailed;

fn failing_work(rt: &Runtime) -> Result<(), KernelFailed> {
    let _scope = rt.device("rdna:1").unwrap();
    assert_eq!(rt.current_device().unwrap(), 1);
    Err(KernelFailed)
}

#[test]
fn test_set_device_returns_previous() {
    let rt = runtime(2);
    assert_eq!(rt.current_device().unwrap(), 0);
    assert_eq!(rt.set_device(1).unwrap(), 0);
    assert_eq!(rt.set_device(1).unwrap(), 1);
    assert_eq!(rt.set_device(2).unwrap_err().kind(), ErrorKind::OutOfRange);
    assert_eq!(rt.current_device().unwrap(), 1);
}

#[test]
fn test_scope_restores_on_error_return() {
    let rt = runtime(2);
    rt.set_device(0).unwrap();

    assert!(failing_work(&rt).is_err());
    assert_eq!(rt.current_device().unwrap(), 0);
}

#[test]
fn test_scope_restores_on_panic() {
    let rt = runtime(2);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _scope = rt.device("/device:RDNA:1").unwrap();
        panic!("kernel launch failed");
    }));

    assert!(result.is_err());
    assert_eq!(rt.current_device().unwrap(), 0);

    let result = catch_unwind(AssertUnwindSafe(|| {
        rt.with_device(1, || panic!("inside with_device"))
    }));
    assert!(result.is_err());
    assert_eq!(rt.current_device().unwrap(), 0);
}

#[test]
fn test_nested_scopes() {
    let rt = runtime(3);
    {
        let _a = rt.device("rdna:2").unwrap();
        {
            let _b = rt.device_index(1).unwrap();
            let inner = rt.with_device(0, || rt.current_device().unwrap()).unwrap();
            assert_eq!(inner, 0);
            assert_eq!(rt.current_device().unwrap(), 1);
        }
        assert_eq!(rt.current_device().unwrap(), 2);
    }
    assert_eq!(rt.current_device().unwrap(), 0);
}

#[test]
fn test_malformed_string_does_not_mutate() {
    let rt = runtime(2);
    rt.set_device(1).unwrap();

    for input in ["gpu:0", "rdna:one", "rdna:-1", "/device:RDNA:x"] {
        let err = rt.device(input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "input {input:?}");
        assert_eq!(rt.current_device().unwrap(), 1);
    }

    let err = rt.device("rdna:5").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(rt.current_device().unwrap(), 1);
}

#[test]
fn test_allocation_inside_scope_targets_scoped_device() {
    let rt = runtime(2);
    let block = {
        let _scope = rt.device("rdna:1").unwrap();
        rt.allocate(1 << 20).unwrap()
    };
    assert_eq!(block.device_index(), 1);
    assert_eq!(rt.memory_allocated(Some(1)).unwrap(), 1 << 20);
    assert_eq!(rt.memory_allocated(None).unwrap(), 0);
    rt.free(block).unwrap();
}
