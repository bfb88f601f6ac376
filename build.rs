fn main() {
    // Build information is used to generate the EPK of the demo application
    build_info_build::build_script();
}
