//! Token-bucket rate shaping for outbound send paths.
//!
//! Two bucket variants share the same calling convention: the standard
//! fill-style [`TokenBucket`] and the inverted [`TokenBucketLeaky`].
//! [`RateLimitedSender`] wires either variant in front of a byte-oriented
//! transmitter, charging eight tokens per byte sent.

pub mod bucket;
pub mod leaky;

pub use bucket::TokenBucket;
pub use leaky::TokenBucketLeaky;

use std::io;
use std::time::Duration;

/// Error type for the shaped send path.
#[derive(Debug, thiserror::Error)]
pub enum ShaperError {
    /// A non-blocking send could not get tokens.
    #[error("send refused by rate limiter")]
    RateLimited,
    #[error("transmit error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ShaperError>;

/// Something that can move bytes, typically a socket.
pub trait Transmitter {
    fn transmit(&mut self, data: &[u8]) -> io::Result<usize>;
}

impl<T: FnMut(&[u8]) -> io::Result<usize>> Transmitter for T {
    fn transmit(&mut self, data: &[u8]) -> io::Result<usize> {
        self(data)
    }
}

/// Which bucket variant shapes the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    Standard,
    Leaky,
}

enum Bucket {
    Standard(TokenBucket),
    Leaky(TokenBucketLeaky),
}

impl Bucket {
    fn rate(&self) -> u64 {
        match self {
            Bucket::Standard(b) => b.rate(),
            Bucket::Leaky(b) => b.rate(),
        }
    }

    fn try_to_drain(&mut self, length: u64) -> bool {
        match self {
            Bucket::Standard(b) => b.try_to_drain(length),
            Bucket::Leaky(b) => b.try_to_drain(length),
        }
    }
}

/// Default depth for the standard bucket: one maximally sized datagram in
/// bits.
const STANDARD_DEPTH_TOKENS: u64 = 65_535 * 8;

/// A transmitter with a token bucket in front of it.
///
/// A send charges `len * 8` tokens (bits). A rate of zero disables shaping.
/// Blocking sends poll the bucket with a one microsecond sleep; non-blocking
/// sends fail with [`ShaperError::RateLimited`] when tokens are short.
pub struct RateLimitedSender<T: Transmitter> {
    bucket: Bucket,
    inner: T,
}

impl<T: Transmitter> RateLimitedSender<T> {
    pub fn new(rate: u64, bucket_type: BucketType, inner: T) -> Self {
        let bucket = match bucket_type {
            BucketType::Standard => {
                Bucket::Standard(TokenBucket::new(STANDARD_DEPTH_TOKENS, rate))
            }
            BucketType::Leaky => Bucket::Leaky(TokenBucketLeaky::new(rate)),
        };
        Self { bucket, inner }
    }

    /// Send, waiting for tokens if `wait_till_sent` is set.
    pub fn send(&mut self, data: &[u8], wait_till_sent: bool) -> Result<usize> {
        if self.bucket.rate() != 0 {
            let needed = data.len() as u64 * 8;
            while !self.bucket.try_to_drain(needed) {
                if !wait_till_sent {
                    return Err(ShaperError::RateLimited);
                }
                std::thread::sleep(Duration::from_micros(1));
            }
        }

        Ok(self.inner.transmit(data)?)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
