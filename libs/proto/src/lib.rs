//! Generated protobuf/gRPC types for the frost allocator surface.
//!
//! The sources live under `api/proto/`; the generated code is committed in
//! `src/gen/` so downstream builds do not need protoc.

pub mod allocator {
    pub mod v1 {
        include!("gen/frost.allocator.v1.rs");

        pub use allocator_client::AllocatorClient;
        pub use allocator_server::{Allocator, AllocatorServer};
    }
}
