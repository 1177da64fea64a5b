//! The demo plugin as a Rust guest.
//!
//! Build with `cargo build --release --target wasm32-unknown-unknown` and
//! copy the `.wasm` into the plugin directory.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

#[link(wasm_import_module = "host")]
extern "C" {
    fn do_something_nifty(host: i32, arg: i32) -> i32;
    fn log(value: i32);
}

/// Host handle given through `set_host`; 0 while unset.
static HOST: AtomicI32 = AtomicI32::new(0);

#[export_name = "ScriptPlugin.new"]
pub extern "C" fn script_plugin_new() -> i32 {
    1
}

#[export_name = "ScriptPlugin.set_host"]
pub extern "C" fn script_plugin_set_host(_this: i32, host: i32) {
    HOST.store(host, Ordering::Relaxed);
}

#[export_name = "ScriptPlugin.test_round_trip"]
pub extern "C" fn script_plugin_test_round_trip(_this: i32, arg: i32) -> i32 {
    unsafe { log(arg) };

    match HOST.load(Ordering::Relaxed) {
        0 => 0,
        host => unsafe { do_something_nifty(host, arg.wrapping_add(10)) },
    }
}
