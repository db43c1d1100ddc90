//! Splitting of a holder's rows into simulated clients.

use ndarray::{Array1, Array2};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

use crate::harmonize::HarmonizedDataset;

/// The default number of rows held back for shuffling batches.
pub const DEFAULT_SHUFFLE_BUFFER: usize = 8192;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot partition an empty dataset")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
/// The rows of one simulated client.
pub struct ClientDataset {
    client: usize,
    data: HarmonizedDataset,
}

#[derive(Debug, Clone, PartialEq)]
/// One minibatch of a client.
pub struct Batch {
    pub features: Array2<f32>,
    pub labels: Array1<f32>,
}

impl ClientDataset {
    /// Gets the index of the client.
    pub fn client(&self) -> usize {
        self.client
    }

    pub fn data(&self) -> &HarmonizedDataset {
        &self.data
    }

    /// Gets the number of examples of the client.
    pub fn rows(&self) -> usize {
        self.data.rows()
    }

    /// Shuffles the rows through a bounded buffer and groups them into batches. The last batch
    /// keeps the remainder.
    ///
    /// The buffer holds `min(rows, shuffle_buffer)` rows: each emitted row is drawn uniformly from
    /// the buffer and its slot is refilled with the next unread row. A buffer of one keeps the
    /// original order.
    pub fn batches<R: Rng + ?Sized>(
        &self,
        shuffle_buffer: usize,
        batch_size: usize,
        rng: &mut R,
    ) -> Vec<Batch> {
        let rows = self.rows();
        let capacity = shuffle_buffer.clamp(1, rows.max(1));
        let mut buffer: Vec<usize> = (0..capacity.min(rows)).collect();
        let mut next = buffer.len();
        let mut order = Vec::with_capacity(rows);
        while !buffer.is_empty() {
            let slot = rng.gen_range(0..buffer.len());
            order.push(buffer[slot]);
            if next < rows {
                buffer[slot] = next;
                next += 1;
            } else {
                buffer.swap_remove(slot);
            }
        }

        order
            .chunks(batch_size.max(1))
            .map(|indices| {
                let (features, labels) = self.data.select(indices).into_parts();
                Batch { features, labels }
            })
            .collect()
    }
}

/// Splits a dataset into near equal sized clients.
///
/// The rows are permuted with a generator seeded from `seed` and cut into `n_clients`
/// contiguous chunks whose sizes differ by at most one, the larger chunks first. The client count
/// is clamped to `1..=rows`, so no client is ever empty.
///
/// # Errors
/// Fails with [`PartitionError::Empty`] if the dataset has no rows.
pub fn partition(
    data: &HarmonizedDataset,
    n_clients: usize,
    seed: u64,
) -> Result<Vec<ClientDataset>, PartitionError> {
    let rows = data.rows();
    if rows == 0 {
        return Err(PartitionError::Empty);
    }
    let clients = n_clients.clamp(1, rows);

    let mut permutation: Vec<usize> = (0..rows).collect();
    permutation.shuffle(&mut ChaCha20Rng::seed_from_u64(seed));

    let (base, larger) = (rows / clients, rows % clients);
    let mut start = 0;
    let mut datasets = Vec::with_capacity(clients);
    for client in 0..clients {
        let size = base + usize::from(client < larger);
        datasets.push(ClientDataset {
            client,
            data: data.select(&permutation[start..start + size]),
        });
        start += size;
    }
    Ok(datasets)
}
