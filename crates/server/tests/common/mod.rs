pub mod fakes;
pub mod server;

#[allow(unused_imports)]
pub use fakes::{FakeGit, FakeRemote};
#[allow(unused_imports)]
pub use server::{DEV, DS2_MASTER, DS2_SHARE_TOKEN, MASTER, TestServer, body_json, user_token};
