// User-to-shard assignment.
//
// The hash is 32-bit FNV-1a over the UTF-8 bytes of the user id, reduced
// modulo the shard count. It is stateless and seedless, so every component
// (and every process built from this source) agrees on the same shard.

use std::num::NonZeroUsize;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: NonZeroUsize,
}

impl ShardRouter {
    pub fn new(shard_count: NonZeroUsize) -> Self {
        Self { shard_count }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count.get()
    }

    /// Empty ids are not special-cased; they hash like any other string.
    pub fn shard_of(&self, user_id: &str) -> usize {
        fnv1a32(user_id.as_bytes()) as usize % self.shard_count.get()
    }

    /// Shards a message from `sender` to `receivers` must be handed to: the
    /// sender's own shard first, then each receiver's shard in first-seen
    /// order. Each shard appears once.
    pub fn route_targets<S: AsRef<str>>(&self, sender: &str, receivers: &[S]) -> Vec<usize> {
        let mut targets = Vec::with_capacity((receivers.len() + 1).min(self.shard_count()));
        targets.push(self.shard_of(sender));
        for receiver in receivers {
            if targets.len() == self.shard_count() {
                break;
            }
            let shard = self.shard_of(receiver.as_ref());
            if !targets.contains(&shard) {
                targets.push(shard);
            }
        }
        targets
    }
}
