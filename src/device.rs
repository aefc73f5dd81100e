//! Device identification: normalizes an accelerator handle into the
//! vendor/chip/family identity and the capability set the solvers key
//! their decisions on.

use crate::compute::Device;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceVendor {
    Amd,
    Nvidia,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceChip {
    Redwood,
    Juniper,
    Cypress,
    Hemlock,
    Cayman,
    Tahiti,
    GeforceGtx480,
    GeforceGtx580,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    Evergreen,
    Fermi,
    Unknown,
}

/// Vendor/chip/family identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdent {
    pub vendor: DeviceVendor,
    pub chip: DeviceChip,
    pub family: DeviceFamily,
}

/// Capability set probed once per device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub wavefront: u32,
    pub compute_units: u32,
    pub max_work_group_size: usize,
    pub lds_size: u64,
    pub data_type_align: u32,
    pub addr_bits: u32,
    pub native_double: bool,
}

/// A device with its probed identity and capabilities. All fields are
/// immutable for the lifetime of the handle.
#[derive(Debug, Clone)]
pub struct TargetDevice {
    pub device: Device,
    pub ident: DeviceIdent,
    pub caps: DeviceCaps,
}

fn vendor_from_string(s: &str) -> DeviceVendor {
    match s {
        "Advanced Micro Devices, Inc." => DeviceVendor::Amd,
        "NVIDIA Corporation" => DeviceVendor::Nvidia,
        _ => DeviceVendor::Unknown,
    }
}

fn chip_from_string(s: &str) -> DeviceChip {
    match s {
        "Redwood" => DeviceChip::Redwood,
        "Juniper" => DeviceChip::Juniper,
        "Cypress" => DeviceChip::Cypress,
        "Hemlock" => DeviceChip::Hemlock,
        "Cayman" => DeviceChip::Cayman,
        "Tahiti" => DeviceChip::Tahiti,
        "GeForce GTX 480" => DeviceChip::GeforceGtx480,
        "GeForce GTX 580" => DeviceChip::GeforceGtx580,
        _ => DeviceChip::Unknown,
    }
}

fn family_of(chip: DeviceChip) -> DeviceFamily {
    match chip {
        DeviceChip::Redwood
        | DeviceChip::Juniper
        | DeviceChip::Cypress
        | DeviceChip::Hemlock => DeviceFamily::Evergreen,
        DeviceChip::GeforceGtx480 | DeviceChip::GeforceGtx580 => DeviceFamily::Fermi,
        _ => DeviceFamily::Unknown,
    }
}

fn wavefront_of(vendor: DeviceVendor) -> u32 {
    match vendor {
        DeviceVendor::Nvidia => 32,
        _ => 64,
    }
}

/// Checks the extensions string for `name` as a whole token.
fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_whitespace().any(|ext| ext == name)
}

fn probe_native_double(device: &Device) -> Result<bool> {
    if device.preferred_vector_width_double()? != 0 {
        return Ok(true);
    }

    let extensions = device.extensions()?;
    Ok(has_extension(&extensions, "cl_khr_fp64") || has_extension(&extensions, "cl_amd_fp64"))
}

/// Probes `device` once and returns its immutable identity and
/// capability record.
pub fn identify_device(device: &Device) -> Result<TargetDevice> {
    let vendor = vendor_from_string(&device.vendor()?);
    let chip = chip_from_string(&device.name()?);
    let ident = DeviceIdent {
        vendor,
        chip,
        family: family_of(chip),
    };

    let caps = DeviceCaps {
        wavefront: wavefront_of(vendor),
        compute_units: device.max_compute_units()?,
        max_work_group_size: device.max_work_group_size()?,
        lds_size: device.local_mem_size()?,
        data_type_align: device.min_data_type_align()?,
        addr_bits: device.address_bits()?,
        native_double: probe_native_double(device)?,
    };

    Ok(TargetDevice { device: device.clone(), ident, caps })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_strings() {
        assert_eq!(
            vendor_from_string("Advanced Micro Devices, Inc."),
            DeviceVendor::Amd
        );
        assert_eq!(vendor_from_string("NVIDIA Corporation"), DeviceVendor::Nvidia);
        assert_eq!(vendor_from_string("Intel(R) Corporation"), DeviceVendor::Unknown);
    }

    #[test]
    fn chip_families() {
        assert_eq!(family_of(DeviceChip::Cypress), DeviceFamily::Evergreen);
        assert_eq!(family_of(DeviceChip::GeforceGtx580), DeviceFamily::Fermi);
        assert_eq!(family_of(DeviceChip::Tahiti), DeviceFamily::Unknown);
    }

    #[test]
    fn extension_token_boundaries() {
        assert!(has_extension("cl_khr_fp16 cl_khr_fp64", "cl_khr_fp64"));
        assert!(!has_extension("cl_khr_fp64_extended", "cl_khr_fp64"));
        assert!(!has_extension("", "cl_amd_fp64"));
    }
}
