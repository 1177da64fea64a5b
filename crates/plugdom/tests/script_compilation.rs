//! Integration tests for dynamic compilation.

mod common;

use plugdom::CapabilityPolicy;
use plugdom::DomainState;
use plugdom::Error;
use plugdom::Severity;

use common::add_hundred;
use common::fixture;
use common::plugin_dir;
use common::runtime;

// --- Test 1: Capability Gating ---

#[test]
fn test_static_domain_cannot_compile() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("static", CapabilityPolicy::static_only())
        .expect("Failed to create domain");

    match domain.compile(&fixture("script.wat")) {
        Err(Error::PolicyViolation(_)) => {}
        Err(e) => panic!("Wrong error type: {}", e),
        Ok(c) => panic!("Expected PolicyViolation, got {} diagnostics", c.diagnostics.len()),
    }

    let plugin = domain.load("plugin.wat").expect("Failed to load plugin");
    assert!(matches!(
        plugin.compile_script(&fixture("script.wat")),
        Err(Error::PolicyViolation(_))
    ));
    assert_eq!(domain.state(), DomainState::Active);
}

// --- Test 2: Script Round Trip ---

#[test]
fn test_script_round_trip() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("dynamic", CapabilityPolicy::allow_dynamic())
        .expect("Failed to create domain");

    let compilation = domain.compile(&fixture("script.wat")).expect("Compile failed");
    assert!(!compilation.diagnostics.has_errors());

    let warning = compilation
        .diagnostics
        .warnings()
        .next()
        .expect("Declared warning missing");
    assert_eq!(warning.to_string(), "warning: Test warning (line 1, col 4)");

    let script = compilation.script.expect("No script produced");
    assert_eq!(script.entry(), "MyTestClass");
    assert_eq!(script.invoke_round_trip(&add_hundred(), 1).expect("Round trip failed"), 1101);
}

#[test]
fn test_plugin_compiles_on_behalf_of_host() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("dynamic", CapabilityPolicy::allow_dynamic())
        .expect("Failed to create domain");
    let plugin = domain.load("plugin.wat").expect("Failed to load plugin");

    let compilation = plugin.compile_script(&fixture("script.wat")).expect("Compile failed");
    let script = compilation.script.expect("No script produced");
    assert_eq!(script.invoke_round_trip(&add_hundred(), 20).expect("Round trip failed"), 1120);
}

// --- Test 3: Compiler Errors Are Data ---

#[test]
fn test_syntax_error_returns_diagnostics() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("dynamic", CapabilityPolicy::allow_dynamic())
        .expect("Failed to create domain");

    let source = ";; #warning still reported\n(module\n  (func (export \"X.new\") (result i32)\n    i32.const oops))\n";
    let compilation = domain.compile(source).expect("Compile errors must not be faults");

    assert!(compilation.script.is_none());
    assert!(compilation.diagnostics.has_errors());

    let severities: Vec<Severity> = compilation.diagnostics.iter().map(|d| d.severity).collect();
    assert_eq!(severities.first(), Some(&Severity::Warning));
    let error = compilation.diagnostics.errors().next().expect("No error diagnostic");
    assert!(error.line >= 2, "error should point into the module: {}", error);

    assert_eq!(domain.ping(1).expect("Domain should stay usable"), 2);
}

#[test]
fn test_unresolved_import_returns_diagnostics() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("dynamic", CapabilityPolicy::allow_dynamic())
        .expect("Failed to create domain");

    let source = "(module\n  (import \"env\" \"exec\" (func (param i32)))\n  (func (export \"S.new\") (result i32) i32.const 0))";
    let compilation = domain.compile(source).expect("Compile errors must not be faults");

    assert!(compilation.script.is_none());
    let error = compilation.diagnostics.errors().next().expect("No error diagnostic");
    assert!(error.message.contains("unresolved import"));
    assert_eq!(error.line, 2);
}

#[test]
fn test_directive_lookalike_in_data_is_not_a_directive() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("dynamic", CapabilityPolicy::allow_dynamic())
        .expect("Failed to create domain");

    let source = r#"(module
  (import "host" "do_something_nifty" (func $nifty (param i32 i32) (result i32)))
  (memory 1)
  (data (i32.const 0) "a ;; #error not a comment")
  (func (export "S.new") (result i32) i32.const 0)
  (func (export "S.test_script_round_trip") (param i32 i32 i32) (result i32)
    local.get 1
    local.get 2
    call $nifty))"#;
    let compilation = domain.compile(source).expect("Compile failed");

    assert!(compilation.diagnostics.is_empty());
    let script = compilation.script.expect("Clean source must produce a script");
    assert_eq!(script.invoke_round_trip(&add_hundred(), 1).expect("Round trip failed"), 101);
}

// --- Test 4: Clean Unit Without Script Entry ---

#[test]
fn test_clean_unit_without_entry_is_no_entry_type() {
    let dir = plugin_dir();
    let rt = runtime(&dir);
    let domain = rt
        .create_domain("dynamic", CapabilityPolicy::allow_dynamic())
        .expect("Failed to create domain");

    let source = "(module (func (export \"Nothing.new\") (result i32) i32.const 0))";
    match domain.compile(source) {
        Err(Error::NoEntryTypeFound { capability }) => assert_eq!(capability, "script"),
        Err(e) => panic!("Wrong error type: {}", e),
        Ok(_) => panic!("Expected NoEntryTypeFound"),
    }
    assert_eq!(domain.state(), DomainState::Active);
}
