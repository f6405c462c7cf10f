//! Compile FizzBuzz to a relocatable object for the host platform
//!
//! Run with: cargo run --example fizzbuzz
//! This generates: fizzbuzz.o
//!
//! Link and run: cc fizzbuzz.o -o fizzbuzz && ./fizzbuzz

use std::path::Path;

use littlelang::x64::object::write_object_file;
use littlelang::{compile_object, ObjectFormat};

const SOURCE: &str = r#"
int64 counter;
counter = 1;
while (counter <= 100) {
    int64 mod3;
    mod3 = counter % 3;

    int64 mod5;
    mod5 = counter % 5;
    if (mod3 == 0) {
        if (mod5 == 0) {
            printf("FizzBuzz");
        } else {
            printf("Fizz");
        }
    } else if (mod5 == 0) {
        printf("Buzz");
    } else {
        printf("%i", counter);
    }
    counter = counter + 1;
    puts("");
}
exit(0);
"#;

fn main() {
    println!("=== littlelang to x64 object ===\n");
    println!("{}", SOURCE.trim());
    println!("---\n");

    let object = match compile_object(SOURCE) {
        Ok(object) => object,
        Err(e) => {
            eprintln!("Compilation failed: {}", e);
            return;
        }
    };

    println!("Generated {} bytes of code", object.code().len());
    for (i, byte) in object.code().iter().take(64).enumerate() {
        if i > 0 && i % 16 == 0 {
            println!();
        }
        print!("{:02x} ", byte);
    }
    println!("\n");

    let format = ObjectFormat::host();
    let output_path = Path::new("fizzbuzz.o");
    if let Err(e) = write_object_file(&object, format, output_path) {
        eprintln!("Failed to write {}: {}", output_path.display(), e);
        return;
    }

    println!("Written to: {} ({:?})", output_path.display(), format);
    println!("\nTo link and run:");
    println!("  cc {} -o fizzbuzz", output_path.display());
    println!("  ./fizzbuzz");
}
