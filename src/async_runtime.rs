//! Async runtime integration for Tokio and async-std.
//!
//! A tick can block on file reads, HTTP connects and the JPEG decoder, so the
//! wrappers here run each tick on the runtime's blocking thread pool. The
//! async getters go through the same pool, since they wait for the player
//! lock while a tick holds it.
//!
//! # Features
//!
//! - `tokio` - Enable Tokio runtime support
//! - `async-std` - Enable async-std runtime support
//!
//! # Example with Tokio
//!
//! ```no_run
//! # #[cfg(feature = "tokio")]
//! # {
//! use mjpeg_stream::{tokio::AsyncPlayer, FrameBufferDisplay, JpegDecoder, JpegScale, Player, PlayerOptions, Rgb565Image};
//!
//! struct Grey;
//!
//! impl JpegDecoder for Grey {
//!     fn decode(&mut self, _jpeg: &[u8], _scale: JpegScale, out: &mut Rgb565Image) -> mjpeg_stream::Result<()> {
//!         out.resize(1, 1);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mjpeg_stream::Error> {
//!     let options = PlayerOptions::builder().file("clip.mjpeg").build()?;
//!     let player = AsyncPlayer::new(Player::new(options, FrameBufferDisplay::new(320, 240), Grey)?);
//!
//!     loop {
//!         player.tick().await?;
//!         let now = std::time::Instant::now();
//!         match player.next_deadline(now).await? {
//!             Some(at) => tokio::time::sleep(at - now).await,
//!             None => break,
//!         }
//!     }
//!     Ok(())
//! }
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Error, Player, Result};

fn lock<T>(inner: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    inner
        .lock()
        .map_err(|_| Error::TaskFailed("player mutex poisoned by a panicked tick".into()))
}

#[cfg(feature = "tokio")]
pub mod tokio {
    //! Tokio async runtime integration.
    //!
    //! Provides `AsyncPlayer`, which uses `tokio::task::spawn_blocking` to run
    //! ticks without blocking the Tokio runtime.

    use std::time::Instant;

    use super::*;
    use crate::{
        decode::JpegDecoder,
        display::Display,
        player::{PlayerStats, PlayerStatus, TickOutcome},
        source::{Source, SourceDriver},
    };

    /// Async player wrapper for Tokio runtime.
    ///
    /// The player sits behind `Arc<Mutex<_>>`, so clones share one player and
    /// concurrent ticks are serialized.
    pub struct AsyncPlayer<D, J, S = SourceDriver> {
        inner: Arc<Mutex<Player<D, J, S>>>,
    }

    impl<D, J, S> AsyncPlayer<D, J, S>
    where
        D: Display + Send + 'static,
        J: JpegDecoder + Send + 'static,
        S: Source + Send + 'static,
    {
        pub fn new(player: Player<D, J, S>) -> Self {
            Self {
                inner: Arc::new(Mutex::new(player)),
            }
        }

        /// Async version of [`Player::tick`].
        ///
        /// # Errors
        ///
        /// Returns [`Error::TaskFailed`] if the blocking task panicked or a
        /// previous tick poisoned the player.
        pub async fn tick(&self) -> Result<TickOutcome> {
            self.run_locked(|p| p.tick()).await
        }

        pub async fn next_deadline(&self, now: Instant) -> Result<Option<Instant>> {
            self.run_locked(move |p| p.next_deadline(now)).await
        }

        pub async fn status(&self) -> Result<PlayerStatus> {
            self.run_locked(|p| p.status().clone()).await
        }

        pub async fn stats(&self) -> Result<PlayerStats> {
            self.run_locked(|p| *p.stats()).await
        }

        /// Run `f` with the player locked.
        ///
        /// This blocks the calling thread until any running tick finishes.
        pub fn with_player<R>(&self, f: impl FnOnce(&mut Player<D, J, S>) -> R) -> Result<R> {
            Ok(f(&mut lock(&self.inner)?))
        }

        async fn run_locked<R, F>(&self, f: F) -> Result<R>
        where
            R: Send + 'static,
            F: FnOnce(&mut Player<D, J, S>) -> R + Send + 'static,
        {
            let player = Arc::clone(&self.inner);
            ::tokio::task::spawn_blocking(move || lock(&player).map(|mut p| f(&mut *p)))
                .await
                .map_err(|e| Error::TaskFailed(e.to_string()))?
        }
    }

    impl<D, J, S> Clone for AsyncPlayer<D, J, S> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }
}

#[cfg(feature = "async-std")]
pub mod async_std {
    //! async-std runtime integration.
    //!
    //! Provides `AsyncPlayer`, which uses `async_std::task::spawn_blocking`
    //! to run ticks without blocking the async-std runtime.

    use std::time::Instant;

    use super::*;
    use crate::{
        decode::JpegDecoder,
        display::Display,
        player::{PlayerStats, PlayerStatus, TickOutcome},
        source::{Source, SourceDriver},
    };

    pub struct AsyncPlayer<D, J, S = SourceDriver> {
        inner: Arc<Mutex<Player<D, J, S>>>,
    }

    impl<D, J, S> AsyncPlayer<D, J, S>
    where
        D: Display + Send + 'static,
        J: JpegDecoder + Send + 'static,
        S: Source + Send + 'static,
    {
        pub fn new(player: Player<D, J, S>) -> Self {
            Self {
                inner: Arc::new(Mutex::new(player)),
            }
        }

        pub async fn tick(&self) -> Result<TickOutcome> {
            self.run_locked(|p| p.tick()).await
        }

        pub async fn next_deadline(&self, now: Instant) -> Result<Option<Instant>> {
            self.run_locked(move |p| p.next_deadline(now)).await
        }

        pub async fn status(&self) -> Result<PlayerStatus> {
            self.run_locked(|p| p.status().clone()).await
        }

        pub async fn stats(&self) -> Result<PlayerStats> {
            self.run_locked(|p| *p.stats()).await
        }

        /// Blocks the calling thread until any running tick finishes.
        pub fn with_player<R>(&self, f: impl FnOnce(&mut Player<D, J, S>) -> R) -> Result<R> {
            Ok(f(&mut lock(&self.inner)?))
        }

        async fn run_locked<R, F>(&self, f: F) -> Result<R>
        where
            R: Send + 'static,
            F: FnOnce(&mut Player<D, J, S>) -> R + Send + 'static,
        {
            let player = Arc::clone(&self.inner);
            ::async_std::task::spawn_blocking(move || lock(&player).map(|mut p| f(&mut *p))).await
        }
    }

    impl<D, J, S> Clone for AsyncPlayer<D, J, S> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::tokio::AsyncPlayer;
    use crate::decode::{JpegDecoder, JpegScale, Rgb565Image};
    use crate::header::StreamHeader;
    use crate::player::{Player, PlayerOptions, PlayerStatus, TickOutcome};
    use crate::test_support::{container, jpeg_stub, CountingDisplay, MemorySource, StubDecoder};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    /// Holds the decode until the test releases it, or two seconds pass.
    struct GatedDecoder {
        inner: StubDecoder,
        started: Arc<AtomicBool>,
        release: mpsc::Receiver<()>,
        released: Arc<AtomicBool>,
    }

    impl JpegDecoder for GatedDecoder {
        fn decode(&mut self, jpeg: &[u8], scale: JpegScale, out: &mut Rgb565Image) -> crate::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            if self.release.recv_timeout(Duration::from_secs(2)).is_ok() {
                self.released.store(true, Ordering::SeqCst);
            }
            self.inner.decode(jpeg, scale, out)
        }
    }

    #[::tokio::test]
    async fn test_async_tick_delivers_frame() {
        let stream = container(StreamHeader::new(16, 16, 1, 30), &[jpeg_stub(16, 16, 8)]);
        let options = PlayerOptions::builder().file("memory").build().unwrap();
        let player = Player::with_source(
            options,
            MemorySource::new(stream, 64),
            CountingDisplay::new(8, 8),
            StubDecoder::default(),
        )
        .unwrap();
        let player = AsyncPlayer::new(player);

        let outcome = player.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Frame(ref f) if f.is_delivered()));
        assert_eq!(player.stats().await.unwrap().delivered, 1);
        assert_eq!(player.with_player(|p| p.display().presented).unwrap(), 1);
    }

    #[::tokio::test]
    async fn test_getters_leave_runtime_free_during_tick() {
        let stream = container(StreamHeader::new(16, 16, 1, 30), &[jpeg_stub(16, 16, 8)]);
        let options = PlayerOptions::builder().file("memory").build().unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        let (release, gate) = mpsc::channel();
        let decoder = GatedDecoder {
            inner: StubDecoder::default(),
            started: Arc::clone(&started),
            release: gate,
            released: Arc::clone(&released),
        };
        let player = Player::with_source(
            options,
            MemorySource::new(stream, 64),
            CountingDisplay::new(8, 8),
            decoder,
        )
        .unwrap();
        let player = AsyncPlayer::new(player);

        let ticking = ::tokio::spawn({
            let player = player.clone();
            async move { player.tick().await }
        });
        while !started.load(Ordering::SeqCst) {
            ::tokio::task::yield_now().await;
        }

        // The tick holds the lock; waiting for it must not park this thread.
        let status = ::tokio::spawn({
            let player = player.clone();
            async move { player.status().await }
        });
        let deadline = ::tokio::spawn({
            let player = player.clone();
            async move { player.next_deadline(std::time::Instant::now()).await }
        });
        for _ in 0..10 {
            ::tokio::task::yield_now().await;
        }
        assert!(!status.is_finished());
        release.send(()).unwrap();

        let outcome = ticking.await.unwrap().unwrap();
        assert!(matches!(outcome, TickOutcome::Frame(ref f) if f.is_delivered()));
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(status.await.unwrap().unwrap(), PlayerStatus::Ready);
        assert!(deadline.await.unwrap().unwrap().is_some());
    }
}
