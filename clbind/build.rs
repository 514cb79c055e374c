fn main() {
    use build_script_cfg::Cfg;

    let cl = Cfg::new("use_cl");
    if cfg!(feature = "opencl") {
        cl.define();
    }
}
