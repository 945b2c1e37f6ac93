//! Hypothesis space over causal graphs.
//!
//! A hypothesis assigns one value from a finite, ordered set of link strengths
//! to every off-diagonal entry of a `K×K` causal matrix. The space is the full
//! Cartesian product, so it has `|links|^(K²-K)` members. It is built once and
//! shared immutably (behind an `Arc`) by every engine that needs it.
//!
//! Three views of each hypothesis are kept:
//! - link vector: off-diagonal entries in row-major order skipping the diagonal
//! - index vector: the same entries as indices into the link-value list
//! - causal matrix: `K×K`, row-major, diagonal filled with `1.0`
//!
//! Enumeration order is odometer-style with the first link most significant:
//! hypothesis `h` has link `s` at value index `(h / L^(S-s-1)) % L`.

use crate::engine::errors::CoreError;

/// Upper bound on the number of enumerable hypotheses.
pub const MAX_HYPOTHESES: usize = 1 << 22;

/// Number of directed links between `num_variables` variables.
pub fn num_links(num_variables: usize) -> usize {
    num_variables * num_variables.saturating_sub(1)
}

/// `(cause, effect)` pair of the link at position `link` of a link vector.
pub fn link_endpoints(num_variables: usize, link: usize) -> (usize, usize) {
    let cause = link / (num_variables - 1);
    let offset = link % (num_variables - 1);
    let effect = if offset >= cause { offset + 1 } else { offset };
    (cause, effect)
}

/// Position in the link vector of the link `cause -> effect` (`cause != effect`).
pub fn link_position(num_variables: usize, cause: usize, effect: usize) -> usize {
    debug_assert_ne!(cause, effect);
    cause * (num_variables - 1) + if effect > cause { effect - 1 } else { effect }
}

/// Expands a link vector into a row-major `K×K` matrix with a constant diagonal.
pub fn causality_matrix(link_vec: &[f64], num_variables: usize, fill_diag: f64) -> Vec<f64> {
    let mut matrix = vec![fill_diag; num_variables * num_variables];
    let mut idx = 0;
    for i in 0..num_variables {
        for j in 0..num_variables {
            if i != j {
                matrix[i * num_variables + j] = link_vec[idx];
                idx += 1;
            }
        }
    }
    matrix
}

/// Collapses a row-major `K×K` matrix into its off-diagonal link vector.
pub fn causality_vector(matrix: &[f64], num_variables: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(num_links(num_variables));
    for i in 0..num_variables {
        for j in 0..num_variables {
            if i != j {
                out.push(matrix[i * num_variables + j]);
            }
        }
    }
    out
}

/// The enumerated set of candidate causal graphs.
#[derive(Debug, Clone)]
pub struct HypothesisSpace {
    num_variables: usize,
    link_values: Vec<f64>,
    num_links: usize,
    len: usize,
    vectors: Vec<f64>,
    indices: Vec<u16>,
    matrices: Vec<f64>,
}

impl HypothesisSpace {
    /// Enumerates every graph over `num_variables` variables.
    ///
    /// Fails when fewer than two variables or no link values are given, when
    /// link values repeat, or when the space would exceed [`MAX_HYPOTHESES`].
    pub fn new(num_variables: usize, link_values: &[f64]) -> Result<Self, CoreError> {
        if num_variables < 2 {
            return Err(CoreError::Validation(format!(
                "hypothesis space needs at least 2 variables, got {}",
                num_variables
            )));
        }
        validate_link_values(link_values)?;

        let s = num_links(num_variables);
        let c = link_values.len();
        let len = checked_space_size(c, s)?;

        let mut vectors = Vec::with_capacity(len * s);
        let mut indices = Vec::with_capacity(len * s);
        let mut matrices = Vec::with_capacity(len * num_variables * num_variables);

        let mut odometer = vec![0u16; s];
        for _ in 0..len {
            let vector: Vec<f64> = odometer.iter().map(|&k| link_values[k as usize]).collect();
            matrices.extend(causality_matrix(&vector, num_variables, 1.0));
            vectors.extend_from_slice(&vector);
            indices.extend_from_slice(&odometer);

            // Last link is least significant.
            for digit in odometer.iter_mut().rev() {
                *digit += 1;
                if (*digit as usize) < c {
                    break;
                }
                *digit = 0;
            }
        }

        Ok(Self {
            num_variables,
            link_values: link_values.to_vec(),
            num_links: s,
            len,
            vectors,
            indices,
            matrices,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// Number of off-diagonal links per graph (`K²-K`).
    pub fn num_links(&self) -> usize {
        self.num_links
    }

    pub fn link_values(&self) -> &[f64] {
        &self.link_values
    }

    /// Link vector of hypothesis `h`.
    pub fn vector(&self, h: usize) -> &[f64] {
        &self.vectors[h * self.num_links..(h + 1) * self.num_links]
    }

    /// Link-value indices of hypothesis `h`.
    pub fn indices(&self, h: usize) -> &[u16] {
        &self.indices[h * self.num_links..(h + 1) * self.num_links]
    }

    /// Row-major causal matrix of hypothesis `h`.
    pub fn matrix(&self, h: usize) -> &[f64] {
        let k2 = self.num_variables * self.num_variables;
        &self.matrices[h * k2..(h + 1) * k2]
    }

    /// Index of the value in the link-value list, if present.
    pub fn value_index(&self, value: f64) -> Option<usize> {
        self.link_values.iter().position(|&v| v == value)
    }

    /// Hypothesis whose link vector equals `graph` exactly.
    pub fn index_of(&self, graph: &[f64]) -> Option<usize> {
        if graph.len() != self.num_links {
            return None;
        }
        let mut h = 0usize;
        for &value in graph {
            h = h * self.link_values.len() + self.value_index(value)?;
        }
        Some(h)
    }

    /// Sum of absolute link strengths of hypothesis `h`; used to break MAP ties.
    pub fn total_strength(&self, h: usize) -> f64 {
        self.vector(h).iter().map(|v| v.abs()).sum()
    }

    /// Marginalizes a distribution over hypotheses into per-link distributions.
    pub fn models_to_links(&self, model_probs: &[f64]) -> Vec<Vec<f64>> {
        let c = self.link_values.len();
        let mut links = vec![vec![0.0; c]; self.num_links];
        for (h, &p) in model_probs.iter().enumerate() {
            for (s, &k) in self.indices(h).iter().enumerate() {
                links[s][k as usize] += p;
            }
        }
        links
    }

    /// Joint distribution implied by independent per-link distributions.
    pub fn links_to_models(&self, link_probs: &[Vec<f64>]) -> Vec<f64> {
        (0..self.len)
            .map(|h| {
                self.indices(h)
                    .iter()
                    .enumerate()
                    .map(|(s, &k)| link_probs[s][k as usize])
                    .product()
            })
            .collect()
    }
}

pub(crate) fn validate_link_values(link_values: &[f64]) -> Result<(), CoreError> {
    if link_values.is_empty() {
        return Err(CoreError::Validation("link value set must not be empty".into()));
    }
    if link_values.iter().any(|v| !v.is_finite()) {
        return Err(CoreError::Validation("link values must be finite".into()));
    }
    for (i, a) in link_values.iter().enumerate() {
        if link_values[i + 1..].contains(a) {
            return Err(CoreError::Validation(format!("duplicate link value {}", a)));
        }
    }
    if link_values.len() > u16::MAX as usize {
        return Err(CoreError::Validation("too many link values".into()));
    }
    Ok(())
}

fn checked_space_size(num_values: usize, num_links: usize) -> Result<usize, CoreError> {
    let mut len = 1usize;
    for _ in 0..num_links {
        len = len
            .checked_mul(num_values)
            .filter(|&l| l <= MAX_HYPOTHESES)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "hypothesis space {}^{} exceeds {} graphs",
                    num_values, num_links, MAX_HYPOTHESES
                ))
            })?;
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINKS: [f64; 5] = [-1.0, -0.5, 0.0, 0.5, 1.0];

    #[test]
    fn space_has_expected_size_and_unique_members() {
        let space = HypothesisSpace::new(3, &LINKS).unwrap();
        assert_eq!(space.len(), 5usize.pow(6));
        assert_eq!(space.num_links(), 6);

        let mut seen = std::collections::HashSet::new();
        for h in 0..space.len() {
            let key: Vec<u16> = space.indices(h).to_vec();
            assert!(seen.insert(key));
        }
    }

    #[test]
    fn enumeration_is_first_link_most_significant() {
        let space = HypothesisSpace::new(3, &LINKS).unwrap();
        assert_eq!(space.vector(0), &[-1.0; 6]);
        assert_eq!(space.vector(1), &[-1.0, -1.0, -1.0, -1.0, -1.0, -0.5]);
        assert_eq!(space.vector(5), &[-1.0, -1.0, -1.0, -1.0, -0.5, -1.0]);
        assert_eq!(space.vector(space.len() - 1), &[1.0; 6]);
    }

    #[test]
    fn index_of_inverts_enumeration() {
        let space = HypothesisSpace::new(3, &LINKS).unwrap();
        for h in [0, 17, 4242, space.len() - 1] {
            assert_eq!(space.index_of(space.vector(h)), Some(h));
        }
        assert_eq!(space.index_of(&[0.3; 6]), None);
    }

    #[test]
    fn matrix_and_vector_views_agree() {
        let space = HypothesisSpace::new(3, &LINKS).unwrap();
        let h = 1234;
        let m = space.matrix(h);
        assert_eq!(causality_vector(m, 3), space.vector(h));
        for i in 0..3 {
            assert_eq!(m[i * 3 + i], 1.0);
        }
    }

    #[test]
    fn link_positions_round_trip() {
        for k in 2..5 {
            for s in 0..num_links(k) {
                let (i, j) = link_endpoints(k, s);
                assert_ne!(i, j);
                assert_eq!(link_position(k, i, j), s);
            }
        }
    }

    #[test]
    fn models_to_links_and_back_for_product_distribution() {
        let space = HypothesisSpace::new(2, &LINKS).unwrap();
        let links = vec![vec![0.1, 0.2, 0.4, 0.2, 0.1], vec![0.0, 0.0, 1.0, 0.0, 0.0]];
        let models = space.links_to_models(&links);
        assert!((models.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        let back = space.models_to_links(&models);
        for (a, b) in back.iter().flatten().zip(links.iter().flatten()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_oversized_and_degenerate_spaces() {
        assert!(HypothesisSpace::new(5, &LINKS).is_err());
        assert!(HypothesisSpace::new(1, &LINKS).is_err());
        assert!(HypothesisSpace::new(3, &[]).is_err());
        assert!(HypothesisSpace::new(3, &[0.0, 0.0]).is_err());
    }
}
