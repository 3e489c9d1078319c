// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use comm_channel_rs::{
    cfg::config::{BasicChannelConfig, ChannelConfig, Reconfigure},
    memory::{channel_impl::MemoryChannelConfig, endpoint::MemorySide},
    tcp::channel_impl::TcpChannelConfig,
};

#[test]
fn memory_config_verdicts() {
    let a = MemoryChannelConfig::new("ep", MemorySide::A);
    let same = MemoryChannelConfig::new("ep", MemorySide::A);
    let other_side = MemoryChannelConfig::new("ep", MemorySide::B);
    let other_name = MemoryChannelConfig::new("ep2", MemorySide::A);

    assert_eq!(
        a.can_dynamic_reconfigure_with(&same),
        Reconfigure::Identical
    );
    assert_eq!(
        a.can_dynamic_reconfigure_with(&other_side),
        Reconfigure::Restart
    );
    assert_eq!(
        a.can_dynamic_reconfigure_with(&other_name),
        Reconfigure::Restart
    );
}

#[test]
fn knob_only_changes_stay_identical_at_the_transport_level() {
    // The channel upgrades this to a dynamic reconfigure on its own.
    let a = MemoryChannelConfig::new("ep", MemorySide::A);
    let mut b = MemoryChannelConfig::new("ep", MemorySide::A);
    b.basic.default_read_timeout_ms = 250;
    b.basic.auto_reconnect = false;

    assert_eq!(a.can_dynamic_reconfigure_with(&b), Reconfigure::Identical);
    assert_ne!(a.basic(), b.basic());
}

#[test]
fn cross_transport_comparison_demands_a_restart() {
    let mem = MemoryChannelConfig::new("ep", MemorySide::A);
    let tcp = TcpChannelConfig::new("localhost", 3260);
    assert_eq!(
        mem.can_dynamic_reconfigure_with(&tcp),
        Reconfigure::Restart
    );
}

#[test]
fn validation_rejects_broken_configs() {
    assert!(MemoryChannelConfig::new("", MemorySide::A).check_valid().is_err());
    assert!(TcpChannelConfig::new("", 1).check_valid().is_err());
    assert!(TcpChannelConfig::new("localhost", 0).check_valid().is_err());
    assert!(TcpChannelConfig::new("localhost", 3260).check_valid().is_ok());
}

#[test]
fn config_yaml_with_flattened_knobs() -> Result<()> {
    let yaml = "EndpointName: ep\nSide: A\nDefaultReadTimeoutMs: 100\n";
    let cfg: MemoryChannelConfig = serde_yaml::from_str(yaml)?;
    assert_eq!(cfg.endpoint_name, "ep");
    assert_eq!(cfg.side, MemorySide::A);
    assert_eq!(cfg.basic.default_read_timeout_ms, 100);
    assert!(cfg.basic.auto_reconnect);
    Ok(())
}

#[test]
fn basic_config_default_is_valid() {
    assert!(BasicChannelConfig::default().check_valid().is_ok());
}
