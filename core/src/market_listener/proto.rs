//! Generated protobuf types for the upstream market feed wire schema
//! (spec.md §6), compiled by `build.rs` from `proto/market_update.proto`.

include!(concat!(env!("OUT_DIR"), "/oms.market.rs"));
