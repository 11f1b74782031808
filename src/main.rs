fn main() {
    passerelle::run();
}
