//! Typed view of sandbox and container annotations.
//!
//! Annotations are parsed once when a request arrives. Keys that podhost
//! does not recognize are ignored; a recognized key with a malformed value
//! fails the request.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeInclusive;

use podhost_common::annotations as keys;
use podhost_common::config::VmDefaults;
use podhost_common::constants::{CPU_SCALE_MAX, TEMPLATE_VM_SUFFIX};
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ContainerId, IsolationKind, ResourceLimits, SandboxId};
use podhost_core::cgroup::memory::MAX_MEMORY_MB;
use serde::{Deserialize, Serialize};

/// Free-form annotation map carried by sandbox and container configs.
pub type Annotations = BTreeMap<String, String>;

/// How VM memory is backed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBacking {
    /// VM memory may be backed by host virtual memory.
    pub allow_overcommit: bool,
    /// VM memory is committed lazily.
    pub deferred_commit: bool,
    /// VM memory is fully backed by physical pages.
    pub fully_physically_backed: bool,
}

/// VM MMIO layout overrides, in megabytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmioLayout {
    /// Low MMIO gap size.
    pub low_gap_mb: Option<u64>,
    /// High MMIO region base.
    pub high_base_mb: Option<u64>,
    /// High MMIO gap size.
    pub high_gap_mb: Option<u64>,
}

/// Effective shape of a sandbox VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTopology {
    /// VM memory in megabytes.
    pub memory_mb: u64,
    /// Virtual processor count.
    pub processor_count: u32,
    /// Processor cap, `1..=10000`.
    pub processor_limit: Option<u32>,
    /// Processor weight, `1..=10000`.
    pub processor_weight: Option<u32>,
    /// Memory backing mode.
    pub memory: MemoryBacking,
    /// MMIO layout.
    pub mmio: MmioLayout,
    /// Storage bandwidth cap in bytes per second.
    pub storage_bandwidth_max: Option<u64>,
    /// Storage IOPS cap.
    pub storage_iops_max: Option<u64>,
}

impl VmTopology {
    /// Limits view of this topology, as read back through diagnostics.
    #[must_use]
    pub const fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: Some(self.memory_mb),
            cpu_count: Some(self.processor_count),
            cpu_limit: self.processor_limit,
            cpu_weight: self.processor_weight,
            storage_bandwidth_max: self.storage_bandwidth_max,
            storage_iops_max: self.storage_iops_max,
        }
    }

    /// Applies a live resource update.
    pub fn update(&mut self, limits: &ResourceLimits) {
        if let Some(mb) = limits.memory_mb {
            self.memory_mb = mb;
        }
        if let Some(count) = limits.cpu_count {
            self.processor_count = count;
        }
        if limits.cpu_limit.is_some() {
            self.processor_limit = limits.cpu_limit;
        }
        if limits.cpu_weight.is_some() {
            self.processor_weight = limits.cpu_weight;
        }
        if limits.storage_bandwidth_max.is_some() {
            self.storage_bandwidth_max = limits.storage_bandwidth_max;
        }
        if limits.storage_iops_max.is_some() {
            self.storage_iops_max = limits.storage_iops_max;
        }
    }

    /// Checks that a clone VM can be forked from a template saved with this
    /// topology.
    ///
    /// Memory size, memory backing, MMIO layout, and processor count are
    /// baked into saved VM state. Processor limit, weight, and storage QoS
    /// are applied after the fork and may differ.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first field that differs.
    pub fn check_clone(&self, clone: &Self) -> Result<()> {
        check_field("memory size in MB", &self.memory_mb, &clone.memory_mb)?;
        check_field(
            "allow overcommit",
            &self.memory.allow_overcommit,
            &clone.memory.allow_overcommit,
        )?;
        check_field(
            "deferred commit",
            &self.memory.deferred_commit,
            &clone.memory.deferred_commit,
        )?;
        check_field(
            "fully physically backed",
            &self.memory.fully_physically_backed,
            &clone.memory.fully_physically_backed,
        )?;
        check_field("MMIO layout", &self.mmio, &clone.mmio)?;
        check_field(
            "processor count",
            &self.processor_count,
            &clone.processor_count,
        )
    }
}

/// Fails with a "doesn't match" error when a clone field differs from the
/// template's.
///
/// # Errors
///
/// Returns `InvalidArgument` when `template != clone`.
pub fn check_field<T: PartialEq + Debug>(field: &str, template: &T, clone: &T) -> Result<()> {
    if template == clone {
        return Ok(());
    }
    Err(PodhostError::invalid(format!(
        "clone {field} {clone:?} doesn't match template {field} {template:?}"
    )))
}

/// Parsed sandbox annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    /// Sandbox-level resource limits.
    pub limits: ResourceLimits,
    /// VM memory backing.
    pub memory: MemoryBacking,
    /// VM MMIO layout.
    pub mmio: MmioLayout,
    /// Writable file shares are denied.
    pub writable_shares_disabled: bool,
    /// Credential specs are denied.
    pub credentials_disabled: bool,
    /// The sandbox is to be saved as a template.
    pub save_as_template: bool,
    /// Template sandbox this sandbox is cloned from.
    pub template: Option<SandboxId>,
    /// Recognized keys ignored because the isolation backend cannot honour them.
    pub ignored: Vec<String>,
}

impl SandboxOptions {
    /// Parses sandbox annotations for a sandbox of the given isolation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed values or contradictory keys.
    pub fn parse(
        annotations: &Annotations,
        isolation: IsolationKind,
        defaults: &VmDefaults,
    ) -> Result<Self> {
        let reader = Reader(annotations);
        let (writable_shares_disabled, credentials_disabled) = reader.unsafe_operation_policy()?;

        let limits = ResourceLimits {
            memory_mb: reader.memory_mb(keys::VM_MEMORY_SIZE_MB)?,
            cpu_count: reader.u32_in(keys::VM_PROCESSOR_COUNT, 1..=u32::MAX)?,
            cpu_limit: reader.u32_in(keys::VM_PROCESSOR_LIMIT, 1..=CPU_SCALE_MAX)?,
            cpu_weight: reader.weight(keys::VM_PROCESSOR_WEIGHT)?,
            storage_bandwidth_max: reader.positive_u64(keys::VM_STORAGE_QOS_BANDWIDTH_MAX)?,
            storage_iops_max: reader.positive_u64(keys::VM_STORAGE_QOS_IOPS_MAX)?,
        };

        let save_as_template = reader.bool(keys::SAVE_AS_TEMPLATE)?.unwrap_or(false);
        let template = reader
            .string(keys::TEMPLATE_ID)
            .map(parse_vm_template_ref)
            .transpose()?;
        if save_as_template && template.is_some() {
            return Err(PodhostError::invalid(
                "a sandbox cannot be both a template and a clone",
            ));
        }

        let mut ignored = Vec::new();
        let (memory, mmio) = match isolation {
            IsolationKind::Hypervisor => (reader.memory_backing(defaults)?, reader.mmio()?),
            IsolationKind::Process => {
                if save_as_template || template.is_some() {
                    return Err(PodhostError::invalid(
                        "templates and clones require hypervisor isolation",
                    ));
                }
                for key in keys::HYPERVISOR_ONLY {
                    if annotations.contains_key(*key) {
                        tracing::warn!(annotation = key, "ignored on a process-isolated sandbox");
                        ignored.push((*key).to_string());
                    }
                }
                let memory = MemoryBacking {
                    allow_overcommit: defaults.allow_overcommit,
                    deferred_commit: false,
                    fully_physically_backed: false,
                };
                (memory, MmioLayout::default())
            }
        };

        Ok(Self {
            limits,
            memory,
            mmio,
            writable_shares_disabled,
            credentials_disabled,
            save_as_template,
            template,
            ignored,
        })
    }

    /// VM shape for a hypervisor sandbox, with defaults filled in.
    #[must_use]
    pub fn topology(&self, defaults: &VmDefaults) -> VmTopology {
        VmTopology {
            memory_mb: self.limits.memory_mb.unwrap_or(defaults.memory_mb),
            processor_count: self.limits.cpu_count.unwrap_or(defaults.processor_count),
            processor_limit: self.limits.cpu_limit,
            processor_weight: self.limits.cpu_weight,
            memory: self.memory,
            mmio: self.mmio,
            storage_bandwidth_max: self.limits.storage_bandwidth_max,
            storage_iops_max: self.limits.storage_iops_max,
        }
    }
}

/// Parsed container annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Container-level resource limits.
    pub limits: ResourceLimits,
    /// The container is the template container of its sandbox.
    pub save_as_template: bool,
    /// Template container this container is restored from.
    pub template: Option<ContainerId>,
    /// Credential specs are denied for this container.
    pub credentials_disabled: bool,
}

impl ContainerOptions {
    /// Parses container annotations.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed values or when more than one
    /// processor setting is given.
    pub fn parse(annotations: &Annotations) -> Result<Self> {
        let reader = Reader(annotations);
        let limits = ResourceLimits {
            memory_mb: reader.memory_mb(keys::CONTAINER_MEMORY_SIZE_MB)?,
            cpu_count: reader.u32_in(keys::CONTAINER_PROCESSOR_COUNT, 1..=u32::MAX)?,
            cpu_limit: reader.u32_in(keys::CONTAINER_PROCESSOR_LIMIT, 1..=CPU_SCALE_MAX)?,
            cpu_weight: reader.weight(keys::CONTAINER_PROCESSOR_WEIGHT)?,
            storage_bandwidth_max: reader
                .positive_u64(keys::CONTAINER_STORAGE_QOS_BANDWIDTH_MAX)?,
            storage_iops_max: reader.positive_u64(keys::CONTAINER_STORAGE_QOS_IOPS_MAX)?,
        };
        check_processor_exclusive(&limits)?;

        let save_as_template = reader.bool(keys::SAVE_AS_TEMPLATE)?.unwrap_or(false);
        let template = reader.string(keys::TEMPLATE_ID).map(ContainerId::new);
        if save_as_template && template.is_some() {
            return Err(PodhostError::invalid(
                "a container cannot be both a template and a clone",
            ));
        }
        Ok(Self {
            limits,
            save_as_template,
            template,
            credentials_disabled: reader.bool(keys::DISABLE_CREDENTIALS)?.unwrap_or(false),
        })
    }
}

/// Rejects container limits that set more than one processor control.
///
/// # Errors
///
/// Returns `InvalidArgument` if more than one is set.
pub fn check_processor_exclusive(limits: &ResourceLimits) -> Result<()> {
    let set = [
        limits.cpu_count.is_some(),
        limits.cpu_limit.is_some(),
        limits.cpu_weight.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if set > 1 {
        return Err(PodhostError::invalid(
            "only one of container processor count, limit, or weight may be set",
        ));
    }
    Ok(())
}

/// Parses a sandbox-level template reference of the form `<id>@vm`.
fn parse_vm_template_ref(value: &str) -> Result<SandboxId> {
    match value.strip_suffix(TEMPLATE_VM_SUFFIX) {
        Some(id) if !id.is_empty() => Ok(SandboxId::new(id)),
        _ => Err(PodhostError::invalid(format!(
            "annotation {}: {value:?} must name a template sandbox as <id>{TEMPLATE_VM_SUFFIX}",
            keys::TEMPLATE_ID
        ))),
    }
}

struct Reader<'a>(&'a Annotations);

impl Reader<'_> {
    fn string(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Ok(Some(true)),
            "0" | "f" | "false" => Ok(Some(false)),
            _ => Err(malformed(key, raw, "a boolean")),
        }
    }

    fn positive_u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(0) => Err(malformed(key, raw, "a positive integer")),
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(malformed(key, raw, "a positive integer")),
        }
    }

    fn memory_mb(&self, key: &str) -> Result<Option<u64>> {
        match self.positive_u64(key)? {
            Some(mb) if mb > MAX_MEMORY_MB => Err(malformed(
                key,
                self.string(key).unwrap_or_default(),
                &format!("a memory size of at most {MAX_MEMORY_MB} MB"),
            )),
            mb => Ok(mb),
        }
    }

    fn u32_in(&self, key: &str, range: RangeInclusive<u32>) -> Result<Option<u32>> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.trim().parse::<u32>() {
            Ok(value) if range.contains(&value) => Ok(Some(value)),
            _ => Err(malformed(
                key,
                raw,
                &format!("an integer in {}..={}", range.start(), range.end()),
            )),
        }
    }

    /// Processor weight, where 0 means "use the default".
    fn weight(&self, key: &str) -> Result<Option<u32>> {
        Ok(self
            .u32_in(key, 0..=CPU_SCALE_MAX)?
            .filter(|weight| *weight != 0))
    }

    fn unsafe_operation_policy(&self) -> Result<(bool, bool)> {
        let disable_all = self.bool(keys::DISABLE_UNSAFE_OPERATIONS)?.unwrap_or(false);
        let writable = self.bool(keys::VM_DISABLE_WRITABLE_FILE_SHARES)?;
        let credentials = self.bool(keys::DISABLE_CREDENTIALS)?;
        if disable_all {
            for (key, value) in [
                (keys::VM_DISABLE_WRITABLE_FILE_SHARES, writable),
                (keys::DISABLE_CREDENTIALS, credentials),
            ] {
                if value == Some(false) {
                    return Err(PodhostError::invalid(format!(
                        "annotation {key}=false conflicts with {}",
                        keys::DISABLE_UNSAFE_OPERATIONS
                    )));
                }
            }
            return Ok((true, true));
        }
        Ok((writable.unwrap_or(false), credentials.unwrap_or(false)))
    }

    fn memory_backing(&self, defaults: &VmDefaults) -> Result<MemoryBacking> {
        let fully_physically_backed = self.bool(keys::VM_FULLY_PHYSICALLY_BACKED)?.unwrap_or(false);
        let mut allow_overcommit = self
            .bool(keys::VM_MEMORY_ALLOW_OVERCOMMIT)?
            .unwrap_or(defaults.allow_overcommit);
        let mut deferred_commit = self
            .bool(keys::VM_MEMORY_ENABLE_DEFERRED_COMMIT)?
            .unwrap_or(false);
        if fully_physically_backed {
            allow_overcommit = false;
            deferred_commit = false;
        }
        if deferred_commit && !allow_overcommit {
            return Err(PodhostError::invalid(
                "deferred commit is not supported on physically backed VMs",
            ));
        }
        Ok(MemoryBacking {
            allow_overcommit,
            deferred_commit,
            fully_physically_backed,
        })
    }

    fn mmio(&self) -> Result<MmioLayout> {
        Ok(MmioLayout {
            low_gap_mb: self.positive_u64(keys::VM_LOW_MMIO_GAP_MB)?,
            high_base_mb: self.positive_u64(keys::VM_HIGH_MMIO_BASE_MB)?,
            high_gap_mb: self.positive_u64(keys::VM_HIGH_MMIO_GAP_MB)?,
        })
    }
}

fn malformed(key: &str, raw: &str, expected: &str) -> PodhostError {
    PodhostError::invalid(format!("annotation {key}: {raw:?} is not {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn parse_vm(pairs: &[(&str, &str)]) -> Result<SandboxOptions> {
        SandboxOptions::parse(
            &annotations(pairs),
            IsolationKind::Hypervisor,
            &VmDefaults::default(),
        )
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let opts = parse_vm(&[("io.example/whatever", "x")]).expect("parse");
        assert!(opts.limits.is_empty());
        assert!(opts.ignored.is_empty());
    }

    #[test]
    fn malformed_values_are_invalid_arguments() {
        for pairs in [
            [(keys::VM_MEMORY_SIZE_MB, "lots")],
            [(keys::VM_MEMORY_SIZE_MB, "18446744073709551615")],
            [(keys::VM_PROCESSOR_LIMIT, "10001")],
            [(keys::VM_MEMORY_ALLOW_OVERCOMMIT, "maybe")],
            [(keys::TEMPLATE_ID, "abc")],
        ] {
            let err = parse_vm(&pairs).expect_err("malformed");
            assert!(matches!(err, PodhostError::InvalidArgument { .. }), "{pairs:?}");
        }
    }

    #[test]
    fn hypervisor_keys_are_reported_ignored_on_process_sandboxes() {
        let opts = SandboxOptions::parse(
            &annotations(&[
                (keys::VM_MEMORY_ALLOW_OVERCOMMIT, "false"),
                (keys::VM_HIGH_MMIO_GAP_MB, "512"),
                (keys::VM_MEMORY_SIZE_MB, "256"),
            ]),
            IsolationKind::Process,
            &VmDefaults::default(),
        )
        .expect("parse");
        assert_eq!(
            opts.ignored,
            vec![
                keys::VM_MEMORY_ALLOW_OVERCOMMIT.to_string(),
                keys::VM_HIGH_MMIO_GAP_MB.to_string()
            ]
        );
        assert_eq!(opts.limits.memory_mb, Some(256));
    }

    #[test]
    fn fully_physically_backed_forces_commit_off() {
        let opts = parse_vm(&[
            (keys::VM_FULLY_PHYSICALLY_BACKED, "true"),
            (keys::VM_MEMORY_ALLOW_OVERCOMMIT, "true"),
        ])
        .expect("parse");
        assert!(!opts.memory.allow_overcommit);
        assert!(!opts.memory.deferred_commit);

        let err = parse_vm(&[
            (keys::VM_MEMORY_ALLOW_OVERCOMMIT, "false"),
            (keys::VM_MEMORY_ENABLE_DEFERRED_COMMIT, "true"),
        ])
        .expect_err("deferred without overcommit");
        assert!(err.to_string().contains("physically backed"));
    }

    #[test]
    fn unsafe_operations_expand_and_detect_conflicts() {
        let opts = parse_vm(&[(keys::DISABLE_UNSAFE_OPERATIONS, "true")]).expect("parse");
        assert!(opts.writable_shares_disabled);
        assert!(opts.credentials_disabled);

        assert!(
            parse_vm(&[
                (keys::DISABLE_UNSAFE_OPERATIONS, "true"),
                (keys::VM_DISABLE_WRITABLE_FILE_SHARES, "false"),
            ])
            .is_err()
        );
    }

    #[test]
    fn template_reference_needs_vm_suffix() {
        let opts = parse_vm(&[(keys::TEMPLATE_ID, "abc@vm")]).expect("parse");
        assert_eq!(opts.template, Some(SandboxId::new("abc")));
        assert!(parse_vm(&[(keys::TEMPLATE_ID, "@vm")]).is_err());
        assert!(
            parse_vm(&[(keys::TEMPLATE_ID, "abc@vm"), (keys::SAVE_AS_TEMPLATE, "true")]).is_err()
        );
    }

    #[test]
    fn templates_need_hypervisor_isolation() {
        let err = SandboxOptions::parse(
            &annotations(&[(keys::SAVE_AS_TEMPLATE, "true")]),
            IsolationKind::Process,
            &VmDefaults::default(),
        )
        .expect_err("process template");
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));
    }

    #[test]
    fn memory_sizes_must_fit_in_bytes() {
        let largest = MAX_MEMORY_MB.to_string();
        let opts = parse_vm(&[(keys::VM_MEMORY_SIZE_MB, largest.as_str())]).expect("largest");
        assert_eq!(opts.limits.memory_mb, Some(MAX_MEMORY_MB));

        let too_big = (MAX_MEMORY_MB + 1).to_string();
        let err = ContainerOptions::parse(&annotations(&[(
            keys::CONTAINER_MEMORY_SIZE_MB,
            too_big.as_str(),
        )]))
        .expect_err("overflow");
        assert!(err.to_string().contains(keys::CONTAINER_MEMORY_SIZE_MB));
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));
    }

    #[test]
    fn container_processor_settings_are_exclusive() {
        let err = ContainerOptions::parse(&annotations(&[
            (keys::CONTAINER_PROCESSOR_COUNT, "2"),
            (keys::CONTAINER_PROCESSOR_WEIGHT, "100"),
        ]))
        .expect_err("exclusive");
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));

        let opts = ContainerOptions::parse(&annotations(&[
            (keys::CONTAINER_PROCESSOR_WEIGHT, "0"),
            (keys::CONTAINER_MEMORY_SIZE_MB, "128"),
        ]))
        .expect("weight 0 is default");
        assert_eq!(opts.limits.cpu_weight, None);
        assert_eq!(opts.limits.memory_mb, Some(128));
    }

    #[test]
    fn clone_topology_mismatch_names_field() {
        let defaults = VmDefaults::default();
        let template = parse_vm(&[]).expect("template").topology(&defaults);
        let clone = parse_vm(&[(keys::VM_MEMORY_ALLOW_OVERCOMMIT, "false")])
            .expect("clone")
            .topology(&defaults);
        let err = template.check_clone(&clone).expect_err("mismatch");
        assert!(err.to_string().contains("doesn't match"));
        assert!(err.to_string().contains("allow overcommit"));

        let limited = parse_vm(&[(keys::VM_PROCESSOR_LIMIT, "5000")])
            .expect("limited")
            .topology(&defaults);
        template.check_clone(&limited).expect("limit may differ");
    }
}
