fn main() {
    point_filters::cli::run();
}
