//! Element-wise comparison of device output against the host reference.

use std::fmt;

use tracing::{debug, error, info};

use crate::error::{HostError, Result};
use crate::matrix::Matrix;

/// One element where the device disagrees with the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub index: usize,
    /// Value produced by the accelerator.
    pub actual: i32,
    /// Value produced by the host reference.
    pub expected: i32,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hw_results[{i}] = {}, sw_results[{i}] = {}",
            self.actual,
            self.expected,
            i = self.index
        )
    }
}

/// Outcome of comparing every element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub compared: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Turn a failing report into [`HostError::VerificationMismatch`].
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(HostError::VerificationMismatch { mismatches: self.mismatches })
        }
    }
}

/// Compare `device` against `reference`, recording every mismatch.
///
/// The scan never stops early so the full set of differences is available
/// for diagnostics.
///
/// # Errors
///
/// Returns [`HostError::DimensionMismatch`] if the matrices differ in size.
pub fn verify(device: &Matrix, reference: &Matrix) -> Result<VerificationReport> {
    if device.len() != reference.len() {
        return Err(HostError::DimensionMismatch {
            expected: reference.len(),
            actual: device.len(),
        });
    }

    let mismatches: Vec<Mismatch> = device
        .as_slice()
        .iter()
        .zip(reference.as_slice())
        .enumerate()
        .filter(|(_, (hw, sw))| hw != sw)
        .map(|(index, (&actual, &expected))| Mismatch { index, actual, expected })
        .collect();

    for m in &mismatches {
        debug!("{m}");
    }
    if mismatches.is_empty() {
        info!("all {} elements match the reference", device.len());
    } else {
        error!("{} of {} elements differ from the reference", mismatches.len(), device.len());
    }

    Ok(VerificationReport { compared: device.len(), mismatches })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_matrices_pass() {
        let m = Matrix::sequential_mod(4, 10);
        let report = verify(&m, &m).unwrap();
        assert!(report.passed());
        assert_eq!(report.compared, 16);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn every_mismatch_is_recorded() {
        let reference = Matrix::sequential_mod(3, 10);
        let mut device = reference.clone();
        device.as_mut_slice()[0] = 100;
        device.as_mut_slice()[8] = -1;
        let report = verify(&device, &reference).unwrap();
        assert_eq!(
            report.mismatches,
            vec![
                Mismatch { index: 0, actual: 100, expected: 0 },
                Mismatch { index: 8, actual: -1, expected: 8 },
            ]
        );
    }

    #[test]
    fn failing_report_becomes_error() {
        let reference = Matrix::zeros(2);
        let mut device = reference.clone();
        device.as_mut_slice()[3] = 7;
        let err = verify(&device, &reference).unwrap().into_result().unwrap_err();
        match err {
            HostError::VerificationMismatch { mismatches } => {
                assert_eq!(mismatches, vec![Mismatch { index: 3, actual: 7, expected: 0 }]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn size_mismatch_is_error() {
        let err = verify(&Matrix::zeros(2), &Matrix::zeros(3)).unwrap_err();
        assert!(matches!(err, HostError::DimensionMismatch { expected: 9, actual: 4 }));
    }

    #[test]
    fn mismatch_display() {
        let m = Mismatch { index: 5, actual: 1, expected: 2 };
        assert_eq!(m.to_string(), "hw_results[5] = 1, sw_results[5] = 2");
    }
}
