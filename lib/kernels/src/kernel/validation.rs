// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pre-launch argument checks shared by every kernel.
//!
//! Vector accesses cannot be partially out of bounds, so every vectorised dimension
//! must hold a whole number of vectors in its raw (unpadded) extent and be contiguous
//! in memory.

use bytemuck::Pod;

use super::CapabilityProbe;
use crate::descriptor::TensorDescriptor;
use crate::error::{KernelError, Result};
use crate::memory::GlobalBuffer;
use crate::transform::Index;

/// Hardware generations the kernels are built for.
pub const SUPPORTED_DEVICES: &[&str] = &["gfx908", "gfx90a", "gfx940", "gfx941", "gfx942"];

pub fn check_device(kernel: &'static str, probe: &dyn CapabilityProbe) -> Result<()> {
    let device = probe.device_name();
    if SUPPORTED_DEVICES.contains(&device.as_str()) {
        Ok(())
    } else {
        Err(KernelError::UnsupportedDevice {
            kernel,
            device,
            supported: SUPPORTED_DEVICES.join(", "),
        })
    }
}

pub fn check_rank(name: &str, desc: &TensorDescriptor, rank: usize) -> Result<()> {
    if desc.rank() != rank {
        return Err(KernelError::unsupported(format!(
            "{name} must have rank {rank}, got lengths {:?}",
            desc.lengths()
        )));
    }
    Ok(())
}

/// Lengths of `desc` must equal `expected`, dimension by dimension.
pub fn check_lengths(name: &str, desc: &TensorDescriptor, expected: &[Index]) -> Result<()> {
    let lengths = desc.lengths();
    if lengths != expected {
        return Err(KernelError::unsupported(format!(
            "{name} has lengths {lengths:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Element distance between neighbours along `dim`, `None` for unit-length dimensions.
pub fn stride_of(desc: &TensorDescriptor, dim: usize) -> Result<Option<Index>> {
    if desc.length(dim) < 2 {
        return Ok(None);
    }
    let origin = vec![0; desc.rank()];
    let mut next = origin.clone();
    next[dim] = 1;
    Ok(Some(desc.offset(&next)? - desc.offset(&origin)?))
}

/// Vector accesses of `vector_width` along the last dimension of `desc` are allowed.
pub fn check_vector_access(name: &str, desc: &TensorDescriptor, vector_width: usize) -> Result<()> {
    let dim = desc.rank() - 1;
    let extent = desc.length(dim);
    if extent % vector_width as Index != 0 {
        return Err(KernelError::unsupported(format!(
            "{name}: contiguous extent {extent} is not a multiple of the vector width {vector_width}"
        )));
    }
    if vector_width > 1 {
        match stride_of(desc, dim)? {
            Some(1) | None => {}
            Some(stride) => {
                return Err(KernelError::unsupported(format!(
                    "{name}: vectorised dimension has stride {stride}, expected 1"
                )));
            }
        }
    }
    Ok(())
}

/// Every element `desc` can address lies inside `buffer`.
pub fn check_fits<T: Pod>(name: &str, desc: &TensorDescriptor, buffer: &GlobalBuffer<T>) -> Result<()> {
    let required = desc.element_space_size();
    if required > buffer.len() as Index {
        return Err(KernelError::unsupported(format!(
            "{name} addresses {required} elements but its buffer holds {}",
            buffer.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::StaticProbe;
    use rstest::rstest;

    #[rstest]
    #[case("gfx908", true)]
    #[case("gfx942", true)]
    #[case("gfx1100", false)]
    #[case("", false)]
    fn test_device_gate(#[case] device: &str, #[case] supported: bool) {
        let result = check_device("gemm", &StaticProbe::new(device));
        assert_eq!(result.is_ok(), supported);
        if let Err(e) = result {
            assert!(matches!(e, KernelError::UnsupportedDevice { .. }));
        }
    }

    #[test]
    fn test_vector_access() {
        let packed = TensorDescriptor::packed(&[2, 8, 12]).unwrap();
        assert!(check_vector_access("a", &packed, 4).is_ok());
        assert!(check_vector_access("a", &packed, 8).is_err());

        // transposed: the last dimension is strided
        let transposed = TensorDescriptor::naive(&[8, 12], &[1, 8]).unwrap();
        assert_eq!(stride_of(&transposed, 1).unwrap(), Some(8));
        assert!(check_vector_access("b", &transposed, 4).is_err());
        assert!(check_vector_access("b", &transposed, 1).is_ok());
    }

    #[test]
    fn test_fits_and_lengths() {
        let desc = TensorDescriptor::packed(&[3, 5]).unwrap();
        assert!(check_fits("c", &desc, &GlobalBuffer::<f32>::zeroed(15)).is_ok());
        assert!(check_fits("c", &desc, &GlobalBuffer::<f32>::zeroed(14)).is_err());
        assert!(check_lengths("c", &desc, &[3, 5]).is_ok());
        assert!(check_lengths("c", &desc, &[5, 3]).is_err());
        assert!(check_rank("c", &desc, 3).is_err());
    }
}
