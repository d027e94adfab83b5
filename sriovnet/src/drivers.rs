//! Driver policy registry for SR-IOV capable NICs.
//!
//! Whether a VF can (or must) be handed to a userspace poll-mode driver
//! depends on the NIC family. The registry maps a bound kernel driver name
//! to that policy and is injected into the topology inspector so tests can
//! run against synthetic driver sets.

/// Drivers without a netlink representation for their devices. A VF bound
/// to one of these has no kernel netdev to move, tag or address.
pub const USERSPACE_DRIVERS: &[&str] = &["vfio-pci", "uio_pci_generic", "igb_uio"];

/// Binding policy for one NIC family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPolicy {
    /// Marketing/device name, informational only.
    pub name: &'static str,
    /// Kernel driver the policy is keyed on.
    pub driver: &'static str,
    /// Whether userspace operation requires rebinding the PCI function.
    /// Mellanox bifurcated drivers keep the kernel netdev and never rebind.
    pub userspace_bind: bool,
}

/// Lookup table from kernel driver name to binding policy.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    entries: Vec<DriverPolicy>,
}

impl DriverRegistry {
    pub fn new(entries: Vec<DriverPolicy>) -> Self {
        Self { entries }
    }

    /// Resolve the policy for a bound driver name.
    ///
    /// Returns `(userspace_bind, canonical driver name)`. An unknown driver
    /// resolves to `(true, "")`.
    // TODO: unknown drivers should fail once the table covers the i40e
    // family; until then they fall through to "rebind, no canonical name".
    pub fn resolve(&self, driver: &str) -> (bool, &'static str) {
        for entry in &self.entries {
            if entry.driver == driver {
                return (entry.userspace_bind, entry.driver);
            }
        }
        (true, "")
    }

    /// Whether `driver` is a userspace poll-mode driver (no kernel netdev).
    pub fn is_userspace(&self, driver: &str) -> bool {
        USERSPACE_DRIVERS.contains(&driver)
    }
}

impl Default for DriverRegistry {
    /// Built-in table for the NIC families seen in production.
    fn default() -> Self {
        Self::new(vec![
            DriverPolicy {
                name: "ConnectX-5",
                driver: "mlx5_core",
                userspace_bind: false,
            },
            DriverPolicy {
                name: "X710",
                driver: "i40e",
                userspace_bind: true,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_driver_resolves_to_table_entry() {
        let registry = DriverRegistry::default();
        assert_eq!(registry.resolve("mlx5_core"), (false, "mlx5_core"));
        assert_eq!(registry.resolve("i40e"), (true, "i40e"));
    }

    #[test]
    fn unknown_driver_defaults_to_rebind() {
        let registry = DriverRegistry::default();
        assert_eq!(registry.resolve("ixgbevf"), (true, ""));
    }

    #[test]
    fn userspace_driver_set() {
        let registry = DriverRegistry::default();
        assert!(registry.is_userspace("vfio-pci"));
        assert!(registry.is_userspace("igb_uio"));
        assert!(!registry.is_userspace("mlx5_core"));
    }

    #[test]
    fn synthetic_registry() {
        let registry = DriverRegistry::new(vec![DriverPolicy {
            name: "fake",
            driver: "fake_core",
            userspace_bind: true,
        }]);
        assert_eq!(registry.resolve("fake_core"), (true, "fake_core"));
        assert_eq!(registry.resolve("mlx5_core"), (true, ""));
    }
}
