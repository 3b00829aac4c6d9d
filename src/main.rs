fn main() {
    std::process::exit(rvdbm::engine::run());
}
