//! TUN device boundary. The router only ever sees the split read/write
//! halves; this module owns creation and platform configuration.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};

use crate::settings::ConnectionSettings;

/// Capability interface for TUN lifecycle. Must be idempotent and tolerate
/// being invoked again after a partial failure; the client recreates the
/// device on every reconnect because some platforms cache route state on
/// the interface.
pub trait TunConfigurator: Send + Sync {
    fn configure(&self, settings: &ConnectionSettings) -> Result<tun::AsyncDevice>;
    fn deconfigure(&self, settings: &ConnectionSettings);
}

/// Kernel-backed TUN via the `tun` crate.
pub struct NativeConfigurator;

impl TunConfigurator for NativeConfigurator {
    fn configure(&self, settings: &ConnectionSettings) -> Result<tun::AsyncDevice> {
        let mut config = tun::Configuration::default();
        config
            .name(&settings.tun_name)
            .address(settings.tun_addr)
            .netmask(prefix_to_mask(settings.tun_prefix))
            .mtu(settings.mtu as i32)
            .up();

        // Raw IPv4 on the device, no packet-information header.
        #[cfg(target_os = "linux")]
        config.platform(|c| {
            c.packet_information(false);
        });

        tun::create_as_async(&config)
            .context("Failed to open TUN device. Do you have root privileges?")
    }

    fn deconfigure(&self, _settings: &ConnectionSettings) {
        // The kernel reclaims the interface when the device handle drops.
    }
}

fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let prefix = prefix.min(32);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ipv4Addr::from(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_conversion() {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
    }
}
