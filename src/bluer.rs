//! A [`BleAdapter`][crate::BleAdapter] backed by BlueZ through the [`bluer`](::bluer) crate.

mod adapter;
mod error;

pub use adapter::BluerAdapter;
