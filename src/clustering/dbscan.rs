// src/clustering/dbscan.rs

use ndarray::Array2;
use petgraph::unionfind::UnionFind;
use std::collections::HashMap;

/// Label given to points no cluster accepted.
pub const NOISE: i32 = -1;

/// Result of one density-clustering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityLabels {
    /// One label per input point: `0..n_clusters` or `NOISE`.
    pub labels: Vec<i32>,
    pub n_clusters: usize,
}

impl DensityLabels {
    /// Point indices of each cluster, in label order, each ascending.
    pub fn clusters(&self) -> Vec<Vec<usize>> {
        let mut clusters = vec![Vec::new(); self.n_clusters];
        for (idx, &label) in self.labels.iter().enumerate() {
            if label >= 0 {
                clusters[label as usize].push(idx);
            }
        }
        clusters
    }

    pub fn noise(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label == NOISE)
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Density clustering over a precomputed distance matrix.
///
/// A point is core when at least `min_samples` points (itself included) lie
/// within `eps`. Core points within `eps` of each other share a cluster.
/// Clusters are numbered by their lowest-index core point, and a border
/// point joins the lowest-numbered cluster that has a core point within `eps`
/// of it. The result depends only on the matrix, never on hashing order.
pub fn dbscan_precomputed(dist: &Array2<f64>, eps: f64, min_samples: usize) -> DensityLabels {
    let n = dist.nrows();
    if n == 0 {
        return DensityLabels { labels: Vec::new(), n_clusters: 0 };
    }

    let neighborhoods: Vec<Vec<usize>> = (0..n)
        .map(|i| (0..n).filter(|&j| j == i || dist[[i, j]] <= eps).collect())
        .collect();
    let is_core: Vec<bool> = neighborhoods
        .iter()
        .map(|nbrs| nbrs.len() >= min_samples.max(1))
        .collect();

    let mut components = UnionFind::<usize>::new(n);
    for i in (0..n).filter(|&i| is_core[i]) {
        for &j in neighborhoods[i].iter().filter(|&&j| j > i && is_core[j]) {
            components.union(i, j);
        }
    }

    let mut labels = vec![NOISE; n];
    let mut root_to_label: HashMap<usize, i32> = HashMap::new();
    for i in (0..n).filter(|&i| is_core[i]) {
        let root = components.find(i);
        let next = root_to_label.len() as i32;
        labels[i] = *root_to_label.entry(root).or_insert(next);
    }
    for i in (0..n).filter(|&i| !is_core[i]) {
        if let Some(label) = neighborhoods[i]
            .iter()
            .filter(|&&j| is_core[j])
            .map(|&j| labels[j])
            .min()
        {
            labels[i] = label;
        }
    }

    DensityLabels {
        labels,
        n_clusters: root_to_label.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_matrix(points: &[f64]) -> Array2<f64> {
        Array2::from_shape_fn((points.len(), points.len()), |(i, j)| (points[i] - points[j]).abs())
    }

    #[test]
    fn test_two_groups_and_noise() {
        let dist = line_matrix(&[0.0, 0.1, 0.15, 5.0, 5.1, 10.0]);
        let result = dbscan_precomputed(&dist, 0.2, 2);
        assert_eq!(result.n_clusters, 2);
        assert_eq!(result.labels, vec![0, 0, 0, 1, 1, NOISE]);
        assert_eq!(result.clusters(), vec![vec![0, 1, 2], vec![3, 4]]);
        assert_eq!(result.noise(), vec![5]);
    }

    #[test]
    fn test_chain_reachability() {
        // Each neighbour is within eps, the ends are not.
        let dist = line_matrix(&[0.0, 0.2, 0.4, 0.6]);
        let result = dbscan_precomputed(&dist, 0.25, 2);
        assert_eq!(result.n_clusters, 1);
        assert!(result.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_border_point_joins_lowest_cluster() {
        // Two dense groups of four with a non-core point (4) between them.
        let group_a = [0usize, 1, 2, 3];
        let group_b = [5usize, 6, 7, 8];
        let dist = Array2::from_shape_fn((9, 9), |(i, j)| {
            if i == j {
                0.0
            } else if (group_a.contains(&i) && group_a.contains(&j))
                || (group_b.contains(&i) && group_b.contains(&j))
            {
                0.1
            } else if (i == 4 && (j == 3 || j == 5)) || (j == 4 && (i == 3 || i == 5)) {
                0.4
            } else {
                1.0
            }
        });
        let result = dbscan_precomputed(&dist, 0.5, 4);
        assert_eq!(result.n_clusters, 2);
        assert_eq!(result.labels, vec![0, 0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_all_noise_and_empty() {
        let dist = line_matrix(&[0.0, 1.0, 2.0]);
        let result = dbscan_precomputed(&dist, 0.5, 2);
        assert_eq!(result.n_clusters, 0);
        assert_eq!(result.noise(), vec![0, 1, 2]);

        let empty = dbscan_precomputed(&Array2::zeros((0, 0)), 0.5, 2);
        assert!(empty.labels.is_empty());
    }

    #[test]
    fn test_deterministic_across_runs() {
        let dist = line_matrix(&[3.0, 0.0, 3.1, 0.1, 9.0, 0.05]);
        let first = dbscan_precomputed(&dist, 0.2, 2);
        for _ in 0..5 {
            assert_eq!(dbscan_precomputed(&dist, 0.2, 2), first);
        }
        // The cluster containing index 0 is labeled first.
        assert_eq!(first.labels[0], 0);
        assert_eq!(first.labels[1], 1);
    }
}
