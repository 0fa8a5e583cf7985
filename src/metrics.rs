use anyhow::{bail, ensure, Result};

/// Running mean of a value, weighted by the number of samples it covers.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Top-k accuracy in percent for each `k` in `ks`.
///
/// `logits` is row-major `[targets.len(), num_classes]`, already copied to the
/// host. A sample counts as correct for `k` when fewer than `k` classes beat
/// its target, where a tie goes to the lower class index.
pub fn accuracy(
    logits: &[f32],
    num_classes: usize,
    targets: &[usize],
    ks: &[usize],
) -> Result<Vec<f64>> {
    let batch_size = targets.len();
    ensure!(
        logits.len() == batch_size * num_classes,
        "{} logits do not match batch size {batch_size} x {num_classes} classes",
        logits.len()
    );
    if let Some(target) = targets.iter().find(|&&target| target >= num_classes) {
        bail!("target {target} out of range for {num_classes} classes");
    }

    if batch_size == 0 {
        return Ok(vec![0.0; ks.len()]);
    }

    let ranks: Vec<usize> = logits
        .chunks_exact(num_classes)
        .zip(targets)
        .map(|(row, &target)| {
            let score = row[target];
            row.iter()
                .enumerate()
                .filter(|&(class, &other)| other > score || (other == score && class < target))
                .count()
        })
        .collect();

    Ok(ks
        .iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|&&rank| rank < k).count();
            100.0 * correct as f64 / batch_size as f64
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_weighted_mean() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.avg(), 0.0);

        meter.update(1.0, 3);
        meter.update(3.0, 1);

        assert_eq!(meter.count(), 4);
        assert!((meter.avg() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_top1_and_top3() {
        #[rustfmt::skip]
        let logits = [
            0.1, 0.9, 0.0, 0.0, // target 1: rank 0
            0.5, 0.1, 0.3, 0.2, // target 3: rank 2
            0.0, 0.1, 0.2, 0.3, // target 0: rank 3
        ];
        let targets = [1, 3, 0];

        let acc = accuracy(&logits, 4, &targets, &[1, 3]).unwrap();
        assert!((acc[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((acc[1] - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_ties_go_to_lower_index() {
        let logits = [1.0, 1.0, 1.0];

        assert_eq!(accuracy(&logits, 3, &[0], &[1]).unwrap(), vec![100.0]);
        assert_eq!(accuracy(&logits, 3, &[2], &[1, 2]).unwrap(), vec![0.0, 0.0]);
        assert_eq!(accuracy(&logits, 3, &[2], &[3]).unwrap(), vec![100.0]);
    }

    #[test]
    fn test_k_beyond_classes_is_always_correct() {
        let logits = [0.3, 0.2];
        assert_eq!(accuracy(&logits, 2, &[1], &[5]).unwrap(), vec![100.0]);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let logits = [0.1, 0.2, 0.3, 0.4];

        assert!(accuracy(&logits, 3, &[0], &[1]).is_err());
        assert!(accuracy(&logits, 2, &[0, 2], &[1]).is_err());
        assert_eq!(accuracy(&[], 2, &[], &[1, 5]).unwrap(), vec![0.0, 0.0]);
    }
}
