fn main() {
    river_sph::start();
}
