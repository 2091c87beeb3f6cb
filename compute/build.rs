fn main() {
    use build_script_cfg::Cfg;
    use std::env::var;

    let cpu = Cfg::new("use_cpu");
    let metal = Cfg::new("use_metal");
    if cfg!(feature = "common-cpu") {
        cpu.define();
    }
    if cfg!(feature = "apple-metal") && var("CARGO_CFG_TARGET_OS").is_ok_and(|os| os == "macos") {
        metal.define();
    }
}
