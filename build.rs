// SPDX-License-Identifier: Apache-2.0 OR MIT
fn main() {
    // `cargo tarpaulin` sets this cfg during coverage runs; declare it so
    // normal builds do not emit "unexpected cfg" warnings.
    println!("cargo:rustc-check-cfg=cfg(tarpaulin)");
}
