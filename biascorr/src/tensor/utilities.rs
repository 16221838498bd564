//! Module containing utility functions when dealing with tensor shapes

/// Row-major strides for a tensor of the given shape
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Converts a position given in "cartesian" form to the relevant index in a row-major buffer.
/// Coordinates are assumed to be in range.
pub(crate) fn flat_index(coords: &[usize], strides: &[usize]) -> usize {
    coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum()
}

/// Given a tensor shape this function returns all of its coordinates, in row-major order
pub(crate) fn get_all_coords(shape: &[usize]) -> Vec<Vec<usize>> {
    let size = shape.iter().product::<usize>();
    // If size is zero (or the shape is a scalar) we just return an empty vector
    if size == 0 || shape.is_empty() {
        return vec![];
    }

    let mut output: Vec<Vec<usize>> = (0..shape[0]).map(|i| vec![i]).collect();
    for &dim in &shape[1..] {
        output = output
            .into_iter()
            .flat_map(|coords| {
                (0..dim).map(move |i| {
                    let mut round_vec = coords.clone();
                    round_vec.push(i);
                    round_vec
                })
            })
            .collect();
    }

    output
}

/// Helper function that given two shapes of the same rank returns the region they have
/// in common, i.e. the smallest size along every axis.
pub(crate) fn get_common_shape(a: &[usize], b: &[usize]) -> Vec<usize> {
    a.iter()
        .zip(b.iter())
        .map(|(a_dim, b_dim)| *a_dim.min(b_dim))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[5]), vec![1]);
        assert!(strides(&[]).is_empty());
    }

    #[test]
    fn test_coords_are_row_major() {
        let shape = [2, 2, 3];
        let st = strides(&shape);
        let coords = get_all_coords(&shape);
        assert_eq!(coords.len(), 12);
        for (i, c) in coords.iter().enumerate() {
            assert_eq!(flat_index(c, &st), i);
        }
        assert!(get_all_coords(&[3, 0]).is_empty());
    }

    #[test]
    fn test_common_shape() {
        assert_eq!(get_common_shape(&[10, 4, 5, 6], &[10, 4, 4, 7]), vec![10, 4, 4, 6]);
    }
}
