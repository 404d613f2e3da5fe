//! Browser-side checks for the pieces that need no module instance.
//! Run with `wasm-pack test --headless --chrome`.

#![cfg(target_arch = "wasm32")]

use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

#[wasm_bindgen_test]
fn module_url_substitutes_the_script_suffix() {
    assert_eq!(
        wasmlink::web::module_url("https://example.com/app.js"),
        "https://example.com/app_bg.wasm"
    );
    assert_eq!(wasmlink::web::module_url("bundle.mjs"), "bundle.mjs");
}

#[wasm_bindgen_test]
fn surface_dump_is_valid_json() {
    let json = wasmlink::web::surface().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["version"], 1);
    assert!(parsed["capabilities"].as_array().unwrap().len() >= 16);
}
