//! Resource limit bounds: values inside [64MiB, 8GiB] memory and
//! [0.1, 4.0] cpu apply as requested, anything outside is rejected before
//! the container runtime is touched.

mod common;

use isolab::sandbox::{AnalysisConfiguration, ResourceLimits, SecurityConfiguration};
use proptest::prelude::*;

fn limits(cpu_tenths: u32, memory_mib: u64) -> ResourceLimits {
    ResourceLimits {
        cpu: format!("{:.1}", cpu_tenths as f64 / 10.0),
        memory: format!("{}m", memory_mib),
        disk_space: "1g".into(),
    }
}

proptest! {
    #![proptest_config(common::proptest_config())]

    #[test]
    fn in_bounds_limits_apply_without_degradation(cpu in 1u32..=40, memory in 64u64..=8192) {
        let requested = limits(cpu, memory);
        let applied = common::block_on(async {
            let (_runtime, manager) = common::manager();
            let env = manager
                .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
                .await
                .unwrap();
            manager.policy().set_resource_limits(&env.id, &requested).await.unwrap()
        });

        prop_assert!(!applied.degraded);
        prop_assert_eq!(applied.limits.memory_bytes, memory * 1024 * 1024);
        prop_assert!((applied.limits.cpu - cpu as f64 / 10.0).abs() < 1e-9);
    }

    #[test]
    fn memory_out_of_bounds_never_reaches_runtime(
        memory in prop_oneof![1u64..64, 8193u64..65_536],
        cpu in 1u32..=40,
    ) {
        let security = SecurityConfiguration {
            resource_limits: limits(cpu, memory),
            ..Default::default()
        };
        let (code, calls) = common::block_on(async {
            let (runtime, manager) = common::manager();
            let err = manager
                .create_environment(security, AnalysisConfiguration::default())
                .await
                .unwrap_err();
            (err.code(), runtime.calls().len())
        });

        prop_assert_eq!(code, "RESOURCE_ALLOCATION_FAILED");
        prop_assert_eq!(calls, 0);
    }

    #[test]
    fn cpu_out_of_bounds_never_reaches_runtime(
        cpu in prop_oneof![0u32..1, 41u32..200],
        memory in 64u64..=8192,
    ) {
        let security = SecurityConfiguration {
            resource_limits: limits(cpu, memory),
            ..Default::default()
        };
        let (code, calls) = common::block_on(async {
            let (runtime, manager) = common::manager();
            let err = manager
                .create_environment(security, AnalysisConfiguration::default())
                .await
                .unwrap_err();
            (err.code(), runtime.calls().len())
        });

        prop_assert_eq!(code, "RESOURCE_ALLOCATION_FAILED");
        prop_assert_eq!(calls, 0);
    }
}
