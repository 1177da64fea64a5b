//! Console driver: pings a domain, round-trips through a plugin, then
//! compiles and runs a script inside a dynamic domain.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use tracing_subscriber::EnvFilter;

use plugdom::CapabilityPolicy;
use plugdom::HostCallback;
use plugdom::Runtime;
use plugdom::RuntimeConfig;

const PLUGIN: &str = "script_plugin.wat";

const TEST_SCRIPT: &str = r#";; #warning Test warning
(module
  (import "host" "do_something_nifty" (func $nifty (param i32 i32) (result i32)))
  (import "host" "log" (func $log (param i32)))
  (func (export "MyTestClass.new") (result i32)
    i32.const 1)
  (func (export "MyTestClass.test_script_round_trip")
        (param $this i32) (param $host i32) (param $arg i32) (result i32)
    local.get $arg
    call $log
    local.get $host
    local.get $arg
    i32.const 1000
    i32.add
    call $nifty))
"#;

/// Host object handed to plugins and scripts.
struct Host {
    name: &'static str,
}

impl HostCallback for Host {
    fn do_something_nifty(&self, arg: i32) -> i32 {
        println!("{}.do_something_nifty arg={}", self.name, arg);
        arg + 100
    }
}

fn banner(title: &str) {
    println!("----- {} -----", title);
}

fn ping_test(runtime: &Runtime) -> anyhow::Result<()> {
    banner("PingTest");
    runtime.scoped("plugin domain", CapabilityPolicy::static_only(), |domain| {
        println!("ping 1 returned {}", domain.ping(1)?);
        println!("ping 2 returned {}", domain.ping(2)?);
        Ok(())
    })
}

fn plugin_test(runtime: &Runtime) -> anyhow::Result<()> {
    banner("PluginTest");
    runtime.scoped("plugin domain", CapabilityPolicy::static_only(), |domain| {
        let plugin = domain.load(PLUGIN)?;
        println!("Round trip, no host obj: {}", plugin.test_round_trip(1)?);

        let host: Arc<dyn HostCallback> = Arc::new(Host { name: "PluginTest" });
        plugin.set_host_callback(&host)?;
        println!("Round trip, w/ host obj: {}", plugin.test_round_trip(1)?);
        Ok(())
    })
}

fn script_test(runtime: &Runtime) -> anyhow::Result<()> {
    banner("ScriptTest");
    runtime.scoped("plugin domain", CapabilityPolicy::allow_dynamic(), |domain| {
        let host: Arc<dyn HostCallback> = Arc::new(Host { name: "ScriptTest" });

        let plugin = domain.load(PLUGIN)?;
        plugin.set_host_callback(&host)?;

        let compilation = plugin.compile_script(TEST_SCRIPT)?;
        for diagnostic in &compilation.diagnostics {
            if diagnostic.is_error() {
                tracing::error!("{}", diagnostic);
            } else {
                tracing::warn!("{}", diagnostic);
            }
        }

        let Some(script) = compilation.script else {
            bail!("compilation failed");
        };
        println!("Round trip to script: {}", script.invoke_round_trip(&host, 1)?);
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = RuntimeConfig::from_env()?;
    if std::env::var_os(plugdom::ENV_PLUGIN_DIR).is_none() {
        config.plugin_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("plugins");
    }
    tracing::info!(plugin_dir = %config.plugin_dir.display(), "starting");

    let runtime = Runtime::new(config).context("failed to start runtime")?;

    ping_test(&runtime)?;
    plugin_test(&runtime)?;
    script_test(&runtime)?;

    println!("Done");
    Ok(())
}
