use crate::variable::Variable;
use approx::AbsDiffEq;

/// Checks that a variable holds a gradient approximately equal to
/// `expected_data` at `expected_shape`.
pub fn check_grad_near(var: &Variable, expected_shape: &[usize], expected_data: &[f32], tol: f32) {
    let tensor = var
        .value()
        .unwrap_or_else(|| panic!("Variable '{}' holds no gradient value", var.name()));

    assert_eq!(
        tensor.shape, expected_shape,
        "Shape mismatch for '{}': expected {:?}, got {:?}",
        var.name(),
        expected_shape,
        tensor.shape
    );

    let actual_data = tensor
        .to_f32_vec()
        .expect("Failed to get F32 data for comparison");

    assert_eq!(
        actual_data.len(),
        expected_data.len(),
        "Data length mismatch: expected {}, got {}",
        expected_data.len(),
        actual_data.len()
    );

    for (i, (a, b)) in actual_data.iter().zip(expected_data.iter()).enumerate() {
        assert!(
            AbsDiffEq::abs_diff_eq(a, b, tol),
            "Data mismatch at index {}: expected {}, got {}. Difference: {}",
            i,
            b,
            a,
            (a - b).abs()
        );
    }
}
